pub mod file_sink;
pub mod mqtt;
pub mod timescale;

pub use file_sink::FileSink;
pub use mqtt::{MqttAdapter, RumqttSession};
pub use timescale::TimescaleSink;

use std::sync::Arc;

use crate::config::{OutputFormat, OutputTarget};
use crate::error::PersistenceError;
use crate::ports::MessageSink;

/// Opens the sink named by the output target.
pub async fn open_sink(target: &OutputTarget, format: OutputFormat) -> Result<Arc<dyn MessageSink>, PersistenceError> {
    match target {
        OutputTarget::File(path) => Ok(Arc::new(FileSink::open(path.clone(), format).await?)),
        OutputTarget::Postgres(url) => Ok(Arc::new(TimescaleSink::connect(url).await?)),
    }
}
