use config::shared::{
    BatchConfig, ChannelKind, IncrementalConfig, InventoryConfig, JobConfig, JobShardConfig,
    PgConnectionConfig, PipelineChannelConfig, TlsConfig,
};

/// Job whose shard items each migrate `public.t_order`, with intervals short enough for
/// tests.
pub fn test_job_config(job_id: &str, shard_count: u32) -> JobConfig {
    JobConfig {
        job_id: job_id.to_string(),
        source: PgConnectionConfig {
            host: "localhost".to_string(),
            port: 5432,
            name: "migration_source".to_string(),
            username: "postgres".to_string(),
            password: None,
            tls: TlsConfig::default(),
        },
        channel: PipelineChannelConfig {
            kind: ChannelKind::Multiplexed,
            partitions: 2,
            capacity: 64,
        },
        batch: BatchConfig {
            max_size: 16,
            max_fetch_ms: 10,
        },
        incremental: IncrementalConfig {
            poll_interval_ms: 1,
            connect_retry_delay_ms: 1,
            ..Default::default()
        },
        inventory: InventoryConfig {
            enabled: true,
            batch_size: 2,
        },
        shards: (0..shard_count)
            .map(|_| JobShardConfig {
                tables: vec!["public.t_order".to_string()],
            })
            .collect(),
    }
}
