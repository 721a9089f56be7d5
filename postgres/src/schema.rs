use pg_escape::{quote_identifier, quote_literal};
use sqlx::{PgPool, prelude::FromRow};

/// A column of a source table together with its key membership.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct SourceColumnRow {
    pub name: String,
    /// Type as printed by `format_type`, e.g. `character varying(20)`.
    pub type_name: String,
    pub is_primary_key: bool,
    pub is_unique_key: bool,
}

/// Loads the columns of `schema.table` in attribute order.
///
/// Returns an empty list when the table does not exist.
pub async fn fetch_table_columns(
    pool: &PgPool,
    schema: &str,
    table: &str,
) -> sqlx::Result<Vec<SourceColumnRow>> {
    // The regclass literal keeps identifier quoting rules identical to the server's.
    let qualified_name = quote_literal(&format!(
        "{}.{}",
        quote_identifier(schema),
        quote_identifier(table)
    ));

    let query = format!(
        r#"
        select
            a.attname as name,
            format_type(a.atttypid, a.atttypmod) as type_name,
            coalesce(bool_or(i.indisprimary), false) as is_primary_key,
            coalesce(bool_or(i.indisunique and not i.indisprimary), false) as is_unique_key
        from pg_attribute a
        left join pg_index i
            on i.indrelid = a.attrelid and a.attnum = any(i.indkey)
        where a.attrelid = to_regclass({qualified_name})
            and a.attnum > 0
            and not a.attisdropped
        group by a.attnum, a.attname, a.atttypid, a.atttypmod
        order by a.attnum
        "#
    );

    sqlx::query_as::<_, SourceColumnRow>(&query)
        .fetch_all(pool)
        .await
}
