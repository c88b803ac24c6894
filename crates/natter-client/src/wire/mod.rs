// Read-side wire helpers: line/payload IO, protocol dispatch, decode logging.
pub(crate) use self::decode_log::log_protocol_error;
pub(crate) use self::line_io::{read_control_line, read_payload};
pub(crate) use self::parser::{ParserLimits, ProtocolHandler, run_parser_loop};

mod decode_log;
mod line_io;
mod parser;
