// The message store is a single append-only table in a single-file SQLite
// database with WAL journaling:
//
//   queue(id INTEGER PRIMARY KEY AUTOINCREMENT,
//         topic TEXT, format TEXT, body TEXT, timestamp TEXT)
//
// No deletes, no updates. Exactly one connection in the process ever
// writes: the one owned by the WriteGateway worker thread. Everything else
// opens read-only connections, which WAL lets proceed concurrently with
// the writer.

use herald_base::{Format, Locate, Message, Result, Site};
use rusqlite::{params, Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

mod gateway;

#[cfg(test)]
mod test;

pub use gateway::{WriteCallback, WriteGateway, WriteOp, SYNC_TIMEOUT};

const INIT_ATTEMPTS: u32 = 3;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Owns the database location and hands out connections. The write
/// connection is claimed once, by the gateway worker.
pub struct Store {
    path: PathBuf,
}

impl Store {
    /// Open (creating if necessary) the store at `path`, retrying schema
    /// initialization up to 3 times with exponential backoff. A final
    /// failure here is fatal to the caller by contract.
    pub fn open(path: impl Into<PathBuf>) -> Result<Store> {
        let path = path.into();
        let mut delay = Duration::from_secs(1);
        let mut attempt = 1;
        loop {
            match Store::init_schema(&path) {
                Ok(count) => {
                    info!("store ready at {:?} with {} messages", path, count);
                    return Ok(Store { path });
                }
                Err(e) if attempt < INIT_ATTEMPTS => {
                    warn!(
                        "store init attempt {}/{} failed: {}, retrying in {:?}",
                        attempt, INIT_ATTEMPTS, e, delay
                    );
                    std::thread::sleep(delay);
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn init_schema(path: &Path) -> Result<i64> {
        let dir = match path.parent() {
            Some(parent) if parent != Path::new("") => parent.to_owned(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).at(Site::Store)?;
        probe_writable(&dir)?;

        let conn = Connection::open(path).at(Site::Store)?;
        conn.pragma_update(None, "journal_mode", "WAL").at(Site::Store)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS queue(
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                topic TEXT,
                format TEXT,
                body TEXT,
                timestamp TEXT
            )",
            [],
        )
        .at(Site::Store)?;
        // Read probe; also the count reported at startup.
        let count = conn
            .query_row("SELECT COUNT(*) FROM queue", [], |row| row.get(0))
            .at(Site::Store)?;
        Ok(count)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The sole write connection; callers other than the gateway worker
    /// must not use this.
    pub(crate) fn writer(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path).at(Site::Store)?;
        conn.pragma_update(None, "journal_mode", "WAL").at(Site::Store)?;
        conn.busy_timeout(BUSY_TIMEOUT).at(Site::Store)?;
        Ok(conn)
    }

    /// A read-only connection; any number may exist concurrently.
    pub fn reader(&self) -> Result<StoreReader> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .at(Site::Store)?;
        conn.busy_timeout(BUSY_TIMEOUT).at(Site::Store)?;
        Ok(StoreReader { conn })
    }
}

// The directory has to be writable before SQLite produces its own, less
// helpful, error for that case.
fn probe_writable(dir: &Path) -> Result<()> {
    let probe = dir.join(".herald_write_probe");
    std::fs::write(&probe, b"probe").at(Site::Store)?;
    std::fs::remove_file(&probe).at(Site::Store)?;
    Ok(())
}

pub struct StoreReader {
    conn: Connection,
}

impl StoreReader {
    /// The most recent `limit` records, newest first.
    pub fn recent(&self, limit: u32) -> Result<Vec<Message>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, topic, format, body, timestamp FROM queue
                 ORDER BY id DESC LIMIT ?1",
            )
            .at(Site::Store)?;
        let rows = stmt
            .query_map(params![limit], row_to_message)
            .at(Site::Store)?;
        collect_messages(rows)
    }

    /// Every record for `topic` in id-ascending order; the `all` sentinel
    /// disables the filter.
    pub fn by_topic(&self, topic: &str) -> Result<Vec<Message>> {
        if topic == herald_base::TOPIC_ALL {
            let mut stmt = self
                .conn
                .prepare("SELECT id, topic, format, body, timestamp FROM queue ORDER BY id ASC")
                .at(Site::Store)?;
            let rows = stmt.query_map([], row_to_message).at(Site::Store)?;
            collect_messages(rows)
        } else {
            let mut stmt = self
                .conn
                .prepare(
                    "SELECT id, topic, format, body, timestamp FROM queue
                     WHERE topic = ?1 ORDER BY id ASC",
                )
                .at(Site::Store)?;
            let rows = stmt
                .query_map(params![topic], row_to_message)
                .at(Site::Store)?;
            collect_messages(rows)
        }
    }

    pub fn topics(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT topic FROM queue ORDER BY topic")
            .at(Site::Store)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .at(Site::Store)?;
        let mut topics = Vec::new();
        for row in rows {
            topics.push(row.at(Site::Store)?);
        }
        Ok(topics)
    }

    pub fn count(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM queue", [], |row| row.get(0))
            .at(Site::Store)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let format: String = row.get(2)?;
    Ok(Message {
        id: row.get(0)?,
        topic: row.get(1)?,
        // Rows are only ever written by the gateway with a valid tag, but
        // a foreign row must not poison a whole scan.
        format: Format::parse(&format).unwrap_or(Format::Raw),
        body: row.get(3)?,
        timestamp: row.get(4)?,
    })
}

fn collect_messages(
    rows: impl Iterator<Item = rusqlite::Result<Message>>,
) -> Result<Vec<Message>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row.at(Site::Store)?);
    }
    Ok(out)
}
