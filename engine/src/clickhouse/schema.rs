//! CREATE statement classification and rewriting.
//!
//! Rewriting is deliberately limited to the engine prefix, the engine
//! parameters and macro tokens. Full SQL parsing is unnecessary for the
//! transformations the restore planner performs and would be fragile
//! against ClickHouse syntax evolution.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// `ENGINE = Replicated...MergeTree('/zk/path', 'replica'[, ...])`
    static ref REPLICATED_ENGINE_REGEX: Regex = Regex::new(
        r"(?s)Replicated(?P<engine>\w*MergeTree)\(\s*(?P<zk_path>'[^']*')\s*,\s*(?P<replica>'[^']*')\s*(?P<rest>,)?"
    )
    .unwrap();

    /// Leading `CREATE [MATERIALIZED] ...` / `ATTACH ...` keyword.
    static ref QUERY_START_REGEX: Regex =
        Regex::new(r"^(?P<op>CREATE|ATTACH)(?P<rest>\s)").unwrap();

    /// `ENGINE = <name>` extraction.
    static ref ENGINE_REGEX: Regex =
        Regex::new(r"(?i)ENGINE\s*=\s*(?P<engine>\w+)").unwrap();

    /// `UUID '<uuid>'` clause after the table name.
    static ref UUID_CLAUSE_REGEX: Regex =
        Regex::new(r"UUID\s+'(?P<uuid>[0-9a-fA-F-]+)'").unwrap();

    /// Macro token such as `{replica}` or `{shard}`.
    static ref MACRO_REGEX: Regex = Regex::new(r"\{(?P<name>[^{}]+)\}").unwrap();
}

pub fn is_merge_tree(engine: &str) -> bool {
    engine.contains("MergeTree")
}

pub fn is_replicated(engine: &str) -> bool {
    engine.contains("Replicated")
}

pub fn is_distributed(engine: &str) -> bool {
    engine == "Distributed"
}

pub fn is_view(engine: &str) -> bool {
    matches!(engine, "View" | "MaterializedView" | "LiveView")
}

pub fn is_materialized_view(engine: &str) -> bool {
    engine == "MaterializedView"
}

/// Engines whose data lives outside the server.
pub fn is_external_engine(engine: &str) -> bool {
    matches!(
        engine,
        "Kafka" | "RabbitMQ" | "NATS" | "S3" | "URL" | "HDFS" | "MySQL" | "PostgreSQL" | "ODBC"
            | "JDBC" | "ExternalDistributed"
    )
}

/// Extracts the engine name from a CREATE statement.
pub fn engine_from_sql(sql: &str) -> Option<String> {
    ENGINE_REGEX
        .captures(sql)
        .map(|c| c["engine"].to_string())
}

/// Extracts the database engine from a CREATE DATABASE statement.
///
/// A statement without an explicit engine clause implies `Atomic` on
/// modern servers.
pub fn database_engine_from_sql(sql: &str) -> Option<String> {
    Some(engine_from_sql(sql).unwrap_or_else(|| "Atomic".to_string()))
}

/// Extracts the `UUID '...'` clause value.
pub fn uuid_from_sql(sql: &str) -> Option<String> {
    UUID_CLAUSE_REGEX
        .captures(sql)
        .map(|c| c["uuid"].to_string())
}

/// Replaces the replica argument of a Replicated engine.
///
/// `override_replica_name` is usually the `{replica}` macro so that the
/// destination substitutes its own identity.
pub fn override_replica_name(sql: &str, replica: &str) -> String {
    REPLICATED_ENGINE_REGEX
        .replace(sql, |caps: &regex::Captures| {
            format!(
                "Replicated{}({}, '{}'{}",
                &caps["engine"],
                &caps["zk_path"],
                replica,
                caps.name("rest").map(|m| m.as_str()).unwrap_or(""),
            )
        })
        .into_owned()
}

/// Rewrites a Replicated engine to its non-replicated equivalent.
///
/// The coordination path and replica arguments are dropped together with
/// the `Replicated` prefix.
pub fn force_non_replicated(sql: &str) -> String {
    REPLICATED_ENGINE_REGEX
        .replace(sql, |caps: &regex::Captures| {
            format!("{}(", &caps["engine"])
        })
        .into_owned()
}

/// Rewrites a statement into its ATTACH form.
pub fn to_attach_query(sql: &str) -> String {
    QUERY_START_REGEX
        .replace(sql.trim_start(), "ATTACH$rest")
        .into_owned()
}

/// Rewrites a statement into its CREATE form.
pub fn to_create_query(sql: &str) -> String {
    QUERY_START_REGEX
        .replace(sql.trim_start(), "CREATE$rest")
        .into_owned()
}

/// Extracts the coordination path and replica token of a Replicated
/// engine from a CREATE statement.
pub fn replicated_engine_args(sql: &str) -> Option<(String, String)> {
    REPLICATED_ENGINE_REGEX.captures(sql).map(|caps| {
        let strip = |s: &str| s.trim_matches('\'').to_string();
        (strip(&caps["zk_path"]), strip(&caps["replica"]))
    })
}

/// Expands `{macro}` tokens from the given substitution set.
///
/// Tokens without a substitution are left intact so the destination
/// server can expand them itself.
pub fn replace_macros(s: &str, macros: &std::collections::HashMap<String, String>) -> String {
    MACRO_REGEX
        .replace_all(s, |caps: &regex::Captures| {
            let name = &caps["name"];
            match macros.get(name) {
                Some(value) => value.clone(),
                None => format!("{{{}}}", name),
            }
        })
        .into_owned()
}

/// Compares two CREATE statements modulo whitespace.
pub fn schemas_equal(a: &str, b: &str) -> bool {
    normalize(a) == normalize(b)
}

fn normalize(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    const REPLICATED_CREATE: &str = "CREATE TABLE db1.t1 UUID '9a62e086-1a6d-41e6-9eea-2aff83647ee1' (n Int32) ENGINE = ReplicatedMergeTree('/ch/t1', 'static-replica') ORDER BY n";

    #[test]
    fn test_override_replica_name() {
        let rewritten = override_replica_name(REPLICATED_CREATE, "{replica}");
        assert!(rewritten.contains("ReplicatedMergeTree('/ch/t1', '{replica}')"));
        assert!(!rewritten.contains("static-replica"));
    }

    #[test]
    fn test_override_replica_name_with_extra_args() {
        let sql = "CREATE TABLE db1.t1 (n Int32, v Int32) ENGINE = ReplicatedReplacingMergeTree('/ch/t1', 'r1', v) ORDER BY n";
        let rewritten = override_replica_name(sql, "{replica}");
        assert!(rewritten.contains("ReplicatedReplacingMergeTree('/ch/t1', '{replica}', v)"));
    }

    #[test]
    fn test_force_non_replicated() {
        let rewritten = force_non_replicated(REPLICATED_CREATE);
        assert!(rewritten.contains("ENGINE = MergeTree()"));
        assert!(!rewritten.contains("Replicated"));
        assert!(!rewritten.contains("/ch/t1"));

        let sql = "CREATE TABLE db1.t1 (n Int32, v Int32) ENGINE = ReplicatedReplacingMergeTree('/ch/t1', 'r1', v) ORDER BY n";
        let rewritten = force_non_replicated(sql);
        assert!(rewritten.contains("ENGINE = ReplacingMergeTree( v)"));
    }

    #[test]
    fn test_attach_create_round_trip() {
        let attach = to_attach_query(REPLICATED_CREATE);
        assert!(attach.starts_with("ATTACH TABLE"));

        let create = to_create_query(&attach);
        assert_eq!(REPLICATED_CREATE, create);
    }

    #[test]
    fn test_uuid_from_sql() {
        assert_eq!(
            Some("9a62e086-1a6d-41e6-9eea-2aff83647ee1".to_string()),
            uuid_from_sql(REPLICATED_CREATE)
        );
        assert_eq!(None, uuid_from_sql("CREATE TABLE db1.t1 (n Int32) ENGINE = Log"));
    }

    #[test]
    fn test_replace_macros() {
        let mut macros = HashMap::new();
        macros.insert("replica".to_string(), "clickhouse02".to_string());
        macros.insert("shard".to_string(), "shard1".to_string());

        assert_eq!(
            "/ch/shard1/t1/clickhouse02",
            replace_macros("/ch/{shard}/t1/{replica}", &macros)
        );
        assert_eq!(
            "/ch/{unknown}/clickhouse02",
            replace_macros("/ch/{unknown}/{replica}", &macros)
        );
    }

    #[test]
    fn test_schemas_equal() {
        assert!(schemas_equal(
            "CREATE TABLE t (n Int32)  ENGINE = MergeTree ORDER BY n",
            "CREATE TABLE t (n Int32) ENGINE = MergeTree\nORDER BY n"
        ));
        assert!(!schemas_equal(
            "CREATE TABLE t (n Int32) ENGINE = MergeTree ORDER BY n",
            "CREATE TABLE t (n Int64) ENGINE = MergeTree ORDER BY n"
        ));
    }

    #[test]
    fn test_engine_extraction() {
        assert_eq!(
            Some("ReplicatedMergeTree".to_string()),
            engine_from_sql(REPLICATED_CREATE)
        );
        assert_eq!(
            Some("Atomic".to_string()),
            database_engine_from_sql("CREATE DATABASE db1")
        );
        assert_eq!(
            Some("Replicated".to_string()),
            database_engine_from_sql("CREATE DATABASE db1 ENGINE = Replicated('/ch/db1', '{shard}', '{replica}')")
        );
    }
}
