use std::sync::Arc;

use config::shared::DecodingPluginKind;

use crate::conversions::timestamp::TimestampParser;
use crate::error::PipelineResult;
use crate::wal::{MppdbDecodingPlugin, TestDecodingPlugin, WalEvent};

/// Turns the raw payload of one replication message into a [`WalEvent`].
///
/// Decoding is a pure function of the payload and its log position. Payloads with an
/// unrecognized shape decode to [`WalEvent::Placeholder`]; a recognized row change with an
/// unknown operation is an [`crate::error::ErrorKind::UnknownOperation`] error.
pub trait DecodingPlugin: Send + Sync {
    fn decode(&self, data: &[u8], lsn: u64) -> PipelineResult<WalEvent>;
}

/// Creates the decoder matching the output plugin of the replication slot.
pub fn build_decoding_plugin(
    kind: DecodingPluginKind,
    timestamp_parser: Arc<dyn TimestampParser>,
) -> Arc<dyn DecodingPlugin> {
    match kind {
        DecodingPluginKind::TestDecoding => Arc::new(TestDecodingPlugin::new(timestamp_parser)),
        DecodingPluginKind::MppdbDecoding => Arc::new(MppdbDecodingPlugin::new(timestamp_parser)),
    }
}

/// Parses the transaction id or sequence number that follows a marker keyword.
pub(crate) fn parse_marker_number(text: &str) -> Option<u64> {
    text.split_whitespace().next()?.parse().ok()
}
