mod write_sink;

pub use write_sink::{ErrorCallback, SinkStats, TraceMark, WriteSink};
