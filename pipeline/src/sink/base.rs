use crate::error::PipelineResult;
use crate::types::DataRecord;

/// Applies captured row changes to the target.
///
/// Records of one partition key arrive in source order. A batch is acknowledged only after
/// [`Sink::write_records`] returned successfully, so a failed write is replayed from the
/// last acknowledged position on restart and implementations should tolerate seeing a
/// record twice.
pub trait Sink {
    /// Returns the name of the sink.
    fn name() -> &'static str;

    /// Writes one fetched batch. Called with an empty batch never.
    fn write_records(
        &self,
        records: Vec<DataRecord>,
    ) -> impl Future<Output = PipelineResult<()>> + Send;

    /// Called once when the importer exits. The default implementation is a no-op.
    fn shutdown(&self) -> impl Future<Output = PipelineResult<()>> + Send {
        async { Ok(()) }
    }
}
