pub(crate) mod byte_cursor;
pub(crate) mod bytes;
pub(crate) mod escape;
pub(crate) mod sink;
pub(crate) mod time;
pub(crate) mod utf16;

pub(crate) use self::byte_cursor::ByteCursor;
pub use self::sink::TextSink;
pub(crate) use self::time::format_filetime;
