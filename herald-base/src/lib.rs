mod config;
mod error;
mod message;


pub use config::{Config, BASE_PORT, RPC_PORT_OFFSET};
pub use error::{err, Error, Locate, Result, Site};
pub use message::{
    extract_topic, now_iso8601, parse_frame, validate_format, Format, Frame, Message,
    DEFAULT_TOPIC, MAX_FRAME, TOPIC_ALL,
};
