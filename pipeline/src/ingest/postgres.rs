use std::fmt;
use std::io::BufReader;
use std::pin::Pin;
use std::time::{Duration, Instant};

use bytes::Bytes;
use config::shared::{DecodingPluginKind, IntoConnectOptions, PgConnectionConfig};
use futures::{FutureExt, StreamExt};
use pg_escape::{quote_identifier, quote_literal};
use postgres::time::postgres_now_micros;
use postgres_replication::ReplicationStream;
use postgres_replication::protocol::ReplicationMessage;
use rustls::ClientConfig;
use tokio_postgres::config::ReplicationMode;
use tokio_postgres::error::SqlState;
use tokio_postgres::tls::MakeTlsConnect;
use tokio_postgres::types::PgLsn;
use tokio_postgres::{
    Client, Config, Connection, NoTls, SimpleQueryMessage, SimpleQueryRow, Socket,
};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{Instrument, debug, error, info};

use crate::error::{ErrorKind, PipelineResult};
use crate::ingest::{ReplicationSource, WalPayload};
use crate::{bail, pipeline_error};

/// Spawns a background task driving a Postgres connection until it terminates.
fn spawn_postgres_connection<T>(connection: Connection<Socket, T::Stream>)
where
    T: MakeTlsConnect<Socket>,
    T::Stream: Send + 'static,
{
    let span = tracing::Span::current();
    let task = async move {
        match connection.await {
            Err(err) => error!("an error occurred during the postgres connection: {}", err),
            Ok(()) => info!("postgres connection terminated successfully"),
        }
    }
    .instrument(span);

    // The connection ends when the client is dropped, so the handle is not kept.
    tokio::spawn(task);
}

/// Options passed to the output plugin on `START_REPLICATION`.
fn plugin_options(plugin: DecodingPluginKind) -> &'static str {
    match plugin {
        DecodingPluginKind::TestDecoding => r#"("include-xids" '1', "skip-empty-xacts" '1')"#,
        DecodingPluginKind::MppdbDecoding => {
            r#"("include-xids" 'true', "skip-empty-xacts" 'true')"#
        }
    }
}

/// [`ReplicationSource`] reading a logical replication slot of a Postgres compatible server.
pub struct PgReplicationSource {
    config: PgConnectionConfig,
    plugin: DecodingPluginKind,
    status_interval: Duration,
    client: Option<Client>,
    stream: Option<Pin<Box<ReplicationStream>>>,
    received_lsn: u64,
    flushed_lsn: u64,
    last_status_update: Option<(Instant, u64)>,
}

impl PgReplicationSource {
    pub fn new(
        config: PgConnectionConfig,
        plugin: DecodingPluginKind,
        status_interval: Duration,
    ) -> Self {
        Self {
            config,
            plugin,
            status_interval,
            client: None,
            stream: None,
            received_lsn: 0,
            flushed_lsn: 0,
            last_status_update: None,
        }
    }

    fn client(&self) -> PipelineResult<&Client> {
        match &self.client {
            Some(client) => Ok(client),
            None => bail!(
                ErrorKind::InvalidState,
                "Replication connection is not open"
            ),
        }
    }

    async fn connect_no_tls(&self) -> PipelineResult<Client> {
        let mut config: Config = self.config.with_db();
        config.replication_mode(ReplicationMode::Logical);

        let (client, connection) = config.connect(NoTls).await?;
        spawn_postgres_connection::<NoTls>(connection);

        info!("successfully connected to postgres without tls");

        Ok(client)
    }

    async fn connect_tls(&self) -> PipelineResult<Client> {
        let mut config: Config = self.config.with_db();
        config.replication_mode(ReplicationMode::Logical);

        let mut root_store = rustls::RootCertStore::empty();
        let mut root_certs_reader = BufReader::new(self.config.tls.trusted_root_certs.as_bytes());
        for cert in rustls_pemfile::certs(&mut root_certs_reader) {
            root_store.add(cert?)?;
        }

        let tls_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let (client, connection) = config.connect(MakeRustlsConnect::new(tls_config)).await?;
        spawn_postgres_connection::<MakeRustlsConnect>(connection);

        info!("successfully connected to postgres with tls");

        Ok(client)
    }

    /// Returns the confirmed flush position of `slot_name`.
    async fn get_slot(&self, slot_name: &str) -> PipelineResult<u64> {
        let query = format!(
            r#"select confirmed_flush_lsn from pg_replication_slots where slot_name = {};"#,
            quote_literal(slot_name)
        );

        for message in self.client()?.simple_query(&query).await? {
            if let SimpleQueryMessage::Row(row) = message {
                let lsn: PgLsn =
                    get_row_value(&row, "confirmed_flush_lsn", "pg_replication_slots")?;
                return Ok(lsn.into());
            }
        }

        bail!(
            ErrorKind::ReplicationSlotNotFound,
            "Replication slot not found",
            format!("Replication slot '{slot_name}' not found in database")
        );
    }

    async fn create_slot(&self, slot_name: &str) -> PipelineResult<u64> {
        // Replication commands must stay uppercase, the server's replication lexer does
        // not accept lowercase keywords.
        let query = format!(
            r#"CREATE_REPLICATION_SLOT {} LOGICAL {} NOEXPORT_SNAPSHOT"#,
            quote_identifier(slot_name),
            self.plugin.plugin_name()
        );

        match self.client()?.simple_query(&query).await {
            Ok(messages) => {
                for message in messages {
                    if let SimpleQueryMessage::Row(row) = message {
                        let lsn: PgLsn =
                            get_row_value(&row, "consistent_point", "pg_replication_slots")?;
                        return Ok(lsn.into());
                    }
                }
            }
            Err(err) => {
                if let Some(code) = err.code()
                    && *code == SqlState::DUPLICATE_OBJECT
                {
                    bail!(
                        ErrorKind::ReplicationSlotAlreadyExists,
                        "Replication slot already exists",
                        format!("Replication slot '{slot_name}' already exists in database")
                    );
                }

                return Err(err.into());
            }
        }

        Err(pipeline_error!(
            ErrorKind::SourceQueryFailed,
            "Replication slot creation returned no row"
        ))
    }

    /// Sends a standby status update when forced, when the flushed position moved, or
    /// when the status interval elapsed.
    async fn send_status_update(&mut self, force: bool) -> PipelineResult<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };

        if !force
            && let Some((last_update, last_flushed)) = self.last_status_update
            && last_flushed == self.flushed_lsn
            && last_update.elapsed() < self.status_interval
        {
            return Ok(());
        }

        let write_lsn = PgLsn::from(self.received_lsn.max(self.flushed_lsn));
        let flush_lsn = PgLsn::from(self.flushed_lsn);
        stream
            .as_mut()
            .standby_status_update(write_lsn, flush_lsn, flush_lsn, postgres_now_micros(), 0)
            .await?;

        debug!(%write_lsn, %flush_lsn, "status update sent");

        self.last_status_update = Some((Instant::now(), self.flushed_lsn));

        Ok(())
    }
}

impl ReplicationSource for PgReplicationSource {
    async fn connect(&mut self) -> PipelineResult<()> {
        let client = if self.config.tls.enabled {
            self.connect_tls().await?
        } else {
            self.connect_no_tls().await?
        };
        self.client = Some(client);

        Ok(())
    }

    async fn get_or_create_slot(&mut self, slot_name: &str) -> PipelineResult<u64> {
        match self.get_slot(slot_name).await {
            Ok(lsn) => {
                info!("using existing replication slot '{}'", slot_name);
                Ok(lsn)
            }
            Err(err) if err.kind() == ErrorKind::ReplicationSlotNotFound => {
                info!("creating new replication slot '{}'", slot_name);

                match self.create_slot(slot_name).await {
                    Ok(lsn) => Ok(lsn),
                    // Another worker created the slot in between.
                    Err(err) if err.kind() == ErrorKind::ReplicationSlotAlreadyExists => {
                        self.get_slot(slot_name).await
                    }
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    async fn start_stream(&mut self, slot_name: &str, start_lsn: u64) -> PipelineResult<()> {
        let start = PgLsn::from(start_lsn);
        info!(
            "starting logical replication with slot named '{}' at lsn {}",
            slot_name, start
        );

        let query = format!(
            r#"START_REPLICATION SLOT {} LOGICAL {} {}"#,
            quote_identifier(slot_name),
            start,
            plugin_options(self.plugin)
        );

        let copy_stream = self.client()?.copy_both_simple::<Bytes>(&query).await?;
        self.stream = Some(Box::pin(ReplicationStream::new(copy_stream)));
        self.received_lsn = start_lsn;
        self.flushed_lsn = start_lsn;

        Ok(())
    }

    async fn read_pending(&mut self) -> PipelineResult<Option<WalPayload>> {
        loop {
            let Some(stream) = self.stream.as_mut() else {
                bail!(ErrorKind::InvalidState, "Replication stream is not started");
            };

            let message = match stream.as_mut().next().now_or_never() {
                None => return Ok(None),
                Some(None) => bail!(
                    ErrorKind::SourceIoError,
                    "Replication stream ended unexpectedly"
                ),
                Some(Some(message)) => message?,
            };

            match message {
                ReplicationMessage::XLogData(body) => {
                    self.received_lsn = self.received_lsn.max(body.wal_end());

                    return Ok(Some(WalPayload {
                        lsn: body.wal_start(),
                        data: body.into_data(),
                    }));
                }
                ReplicationMessage::PrimaryKeepAlive(body) => {
                    self.received_lsn = self.received_lsn.max(body.wal_end());

                    if body.reply() == 1 {
                        self.send_status_update(true).await?;
                    }
                }
                _ => {}
            }
        }
    }

    async fn report_flushed(&mut self, lsn: u64) -> PipelineResult<()> {
        self.flushed_lsn = self.flushed_lsn.max(lsn);
        self.send_status_update(false).await
    }

    async fn close(&mut self) -> PipelineResult<()> {
        if self.stream.is_some() {
            // Report the final position so a restart does not replay acknowledged changes.
            self.send_status_update(true).await?;
        }

        self.stream = None;
        self.client = None;

        Ok(())
    }
}

/// Extracts and parses `column_name` from a simple query row.
fn get_row_value<T>(row: &SimpleQueryRow, column_name: &str, table_name: &str) -> PipelineResult<T>
where
    T: std::str::FromStr,
    T::Err: fmt::Debug,
{
    let value = row.try_get(column_name)?.ok_or_else(|| {
        pipeline_error!(
            ErrorKind::SourceSchemaError,
            "Column not found in source table",
            format!("Column '{column_name}' not found in table '{table_name}'")
        )
    })?;

    value.parse().map_err(|e: T::Err| {
        pipeline_error!(
            ErrorKind::ConversionError,
            "Column parsing failed",
            format!(
                "Failed to parse value from column '{column_name}' in table '{table_name}': {e:?}"
            )
        )
    })
}
