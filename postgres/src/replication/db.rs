use sqlx::PgPool;

/// Server settings a logical replication job depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePrerequisites {
    pub wal_level: String,
    pub max_replication_slots: i64,
    /// Whether the connected role has the replication attribute or is a superuser.
    pub can_replicate: bool,
}

impl SourcePrerequisites {
    pub fn has_logical_wal_level(&self) -> bool {
        self.wal_level.eq_ignore_ascii_case("logical")
    }
}

/// Reads the server settings checked before a job starts streaming.
pub async fn fetch_source_prerequisites(pool: &PgPool) -> sqlx::Result<SourcePrerequisites> {
    let (wal_level, max_replication_slots, can_replicate): (String, i64, bool) = sqlx::query_as(
        r#"
        select
            current_setting('wal_level'),
            current_setting('max_replication_slots')::bigint,
            (select r.rolreplication or r.rolsuper from pg_roles r where r.rolname = current_user)
        "#,
    )
    .fetch_one(pool)
    .await?;

    Ok(SourcePrerequisites {
        wal_level,
        max_replication_slots,
        can_replicate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wal_level_check_ignores_case() {
        let prerequisites = SourcePrerequisites {
            wal_level: "LOGICAL".to_string(),
            max_replication_slots: 10,
            can_replicate: true,
        };
        assert!(prerequisites.has_logical_wal_level());

        let prerequisites = SourcePrerequisites {
            wal_level: "replica".to_string(),
            ..prerequisites
        };
        assert!(!prerequisites.has_logical_wal_level());
    }
}
