use std::sync::Arc;
use std::time::Duration;

use config::shared::IncrementalConfig;
use tracing::{debug, info, warn};

use crate::bail;
use crate::channel::PipelineChannel;
use crate::concurrency::stop::StopRx;
use crate::error::{ErrorKind, PipelineResult};
use crate::ingest::{AckedLsn, ReplicationSource, WalPayload};
use crate::metadata::MetadataLoader;
use crate::types::{Position, Record};
use crate::wal::{DecodingPlugin, WalEvent, WalEventConverter};

/// Lifecycle of an [`IncrementalDumper`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumperState {
    Initializing,
    Streaming,
    Stopped,
    Failed,
}

/// Reads a replication slot and pushes the decoded changes into a pipeline channel.
pub struct IncrementalDumper<S, C, M> {
    slot_name: String,
    config: IncrementalConfig,
    source: S,
    decoder: Arc<dyn DecodingPlugin>,
    converter: WalEventConverter<M>,
    channel: Arc<C>,
    acked_lsn: AckedLsn,
    /// Position persisted by a previous run. The slot position is used when absent.
    resume_lsn: Option<u64>,
    stop_rx: StopRx,
    state: DumperState,
    /// Rows of the open transaction when changes are grouped by transaction.
    tx_buffer: Option<Vec<Record>>,
    last_pushed_lsn: Option<u64>,
    reported_lsn: u64,
}

impl<S, C, M> IncrementalDumper<S, C, M>
where
    S: ReplicationSource,
    C: PipelineChannel + Send + Sync,
    M: MetadataLoader + Send + Sync,
{
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        slot_name: String,
        config: IncrementalConfig,
        source: S,
        decoder: Arc<dyn DecodingPlugin>,
        converter: WalEventConverter<M>,
        channel: Arc<C>,
        acked_lsn: AckedLsn,
        resume_lsn: Option<u64>,
        stop_rx: StopRx,
    ) -> Self {
        Self {
            slot_name,
            config,
            source,
            decoder,
            converter,
            channel,
            acked_lsn,
            resume_lsn,
            stop_rx,
            state: DumperState::Initializing,
            tx_buffer: None,
            last_pushed_lsn: None,
            reported_lsn: 0,
        }
    }

    pub fn state(&self) -> DumperState {
        self.state
    }

    /// Position of the last event pushed into the channel.
    pub fn last_pushed_lsn(&self) -> Option<u64> {
        self.last_pushed_lsn
    }

    /// Runs until stop is requested or the stream fails.
    ///
    /// A slot held by another consumer ends the run without error and pushes a `Finished`
    /// record so the importer can drain. The source is closed on every exit path.
    pub async fn run(&mut self) -> PipelineResult<()> {
        let result = self.dump().await;

        if let Err(err) = self.source.close().await {
            warn!(error = %err, slot_name = %self.slot_name, "failed to close replication stream");
        }

        match result {
            Ok(()) => {
                self.state = DumperState::Stopped;
                info!(slot_name = %self.slot_name, "incremental dump stopped");

                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::ReplicationSlotAlreadyActive => {
                self.state = DumperState::Stopped;
                info!(
                    slot_name = %self.slot_name,
                    "replication slot is active in another process, incremental dump exits"
                );

                let position = self.finished_position();
                self.channel
                    .push(vec![Record::Finished { position }])
                    .await
            }
            Err(err) => {
                self.state = DumperState::Failed;

                Err(err)
            }
        }
    }

    /// Position of the `Finished` record, strictly after every pushed record so its
    /// partition keeps increasing positions. Without a pushed record it is the stream
    /// start, where a restart resumes.
    fn finished_position(&self) -> Position {
        match self.last_pushed_lsn {
            Some(lsn) => Position::Wal(lsn.saturating_add(1)),
            None => Position::Wal(self.reported_lsn),
        }
    }

    async fn dump(&mut self) -> PipelineResult<()> {
        if !self.connect_with_retry().await? {
            return Ok(());
        }

        let slot_lsn = self.source.get_or_create_slot(&self.slot_name).await?;
        let start_lsn = self.resume_lsn.unwrap_or(slot_lsn);
        self.source.start_stream(&self.slot_name, start_lsn).await?;
        self.reported_lsn = start_lsn;
        self.state = DumperState::Streaming;

        info!(
            slot_name = %self.slot_name,
            start_position = %Position::Wal(start_lsn),
            "incremental dump started"
        );

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        while !self.stop_rx.is_stopped() {
            self.report_acked_position().await?;

            match self.source.read_pending().await? {
                Some(payload) => self.handle_payload(payload).await?,
                None => {
                    let mut stop_rx = self.stop_rx.clone();
                    tokio::select! {
                        biased;
                        _ = stop_rx.stopped() => {}
                        _ = tokio::time::sleep(poll_interval) => {}
                    }
                }
            }
        }

        Ok(())
    }

    /// Connects to the source, retrying up to the configured number of attempts.
    ///
    /// Returns `false` when stop was requested while waiting for a retry.
    async fn connect_with_retry(&mut self) -> PipelineResult<bool> {
        let max_attempts = self.config.connect_max_attempts.max(1);
        let retry_delay = Duration::from_millis(self.config.connect_retry_delay_ms);

        let mut attempt = 0;
        loop {
            attempt += 1;

            let err = match self.source.connect().await {
                Ok(()) => return Ok(true),
                Err(err) => err,
            };

            if attempt >= max_attempts {
                bail!(
                    ErrorKind::SourceIoError,
                    "Failed to connect to the replication source",
                    format!("Giving up after {attempt} attempts"),
                    source: err
                );
            }

            warn!(attempt, max_attempts, error = %err, "replication connection failed, retrying");

            let mut stop_rx = self.stop_rx.clone();
            tokio::select! {
                biased;
                _ = stop_rx.stopped() => return Ok(false),
                _ = tokio::time::sleep(retry_delay) => {}
            }
        }
    }

    async fn report_acked_position(&mut self) -> PipelineResult<()> {
        let acked_lsn = self.acked_lsn.get();
        if acked_lsn > self.reported_lsn {
            self.source.report_flushed(acked_lsn).await?;
            self.reported_lsn = acked_lsn;
        }

        Ok(())
    }

    async fn handle_payload(&mut self, payload: WalPayload) -> PipelineResult<()> {
        let event = self.decoder.decode(&payload.data, payload.lsn)?;

        let records = match event {
            WalEvent::Begin(begin) if self.config.decode_with_tx => {
                if self.tx_buffer.replace(Vec::new()).is_some() {
                    warn!(position = %begin.position, "begin without commit, dropping open transaction");
                }
                return Ok(());
            }
            WalEvent::Commit(commit) if self.config.decode_with_tx => {
                let mut records = self.tx_buffer.take().unwrap_or_default();
                for record in &mut records {
                    if let Record::Data(record) = record {
                        record.csn = commit.csn;
                    }
                }
                records.push(Record::Placeholder {
                    position: commit.position,
                });
                records
            }
            event => {
                let record = self.converter.convert(event).await?;

                if let (Some(buffer), Record::Data(_)) = (self.tx_buffer.as_mut(), &record) {
                    buffer.push(record);
                    return Ok(());
                }
                // Placeholders inside a transaction are covered by the commit placeholder.
                if self.tx_buffer.is_some() {
                    return Ok(());
                }

                vec![record]
            }
        };

        debug!(count = records.len(), lsn = payload.lsn, "pushing wal records");

        self.channel.push(records).await?;
        self.last_pushed_lsn = Some(payload.lsn);

        Ok(())
    }
}
