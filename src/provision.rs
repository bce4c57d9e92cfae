use sqlx::{Executor, PgPool};
use tracing::info;

use crate::error::{ReplicatorError, Result};

const MAX_IDENTIFIER_LEN: usize = 63;

/// Postgres identifiers are spliced into DDL, so only plain names pass.
fn validate_identifier(kind: &str, name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map_or(false, |c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !valid_start || !valid_rest || name.len() > MAX_IDENTIFIER_LEN {
        return Err(ReplicatorError::Config(format!("invalid {} name: {:?}", kind, name)));
    }
    Ok(())
}

/// DDL that makes `table` publish its row changes on `channel`.
///
/// Returns three statements: the trigger function, a drop of any previous
/// trigger, and the trigger itself.
pub fn trigger_sql(table: &str, channel: &str) -> Result<Vec<String>> {
    validate_identifier("table", table)?;
    validate_identifier("channel", channel)?;

    let function_name = format!("notify_{}_changes", table);
    let trigger_name = format!("trg_{}_notify", table);

    let function = format!(
        r#"CREATE OR REPLACE FUNCTION {function_name}()
RETURNS TRIGGER AS $$
DECLARE
    payload JSON;
BEGIN
    IF TG_OP = 'DELETE' THEN
        payload = json_build_object(
            'table', TG_TABLE_NAME,
            'operation', TG_OP,
            'data', row_to_json(OLD),
            'old_data', row_to_json(OLD)
        );
    ELSIF TG_OP = 'UPDATE' THEN
        payload = json_build_object(
            'table', TG_TABLE_NAME,
            'operation', TG_OP,
            'data', row_to_json(NEW),
            'old_data', row_to_json(OLD)
        );
    ELSE
        payload = json_build_object(
            'table', TG_TABLE_NAME,
            'operation', TG_OP,
            'data', row_to_json(NEW),
            'old_data', NULL
        );
    END IF;

    PERFORM pg_notify('{channel}', payload::text);
    RETURN COALESCE(NEW, OLD);
END;
$$ LANGUAGE plpgsql"#
    );

    let drop_trigger = format!("DROP TRIGGER IF EXISTS {trigger_name} ON {table}");
    let create_trigger = format!(
        "CREATE TRIGGER {trigger_name}\n\
         AFTER INSERT OR UPDATE OR DELETE ON {table}\n\
         FOR EACH ROW EXECUTE FUNCTION {function_name}()"
    );

    Ok(vec![function, drop_trigger, create_trigger])
}

/// Install (or replace) the change trigger on `table`.
pub async fn install_trigger(pool: &PgPool, table: &str, channel: &str) -> Result<()> {
    for statement in trigger_sql(table, channel)? {
        pool.execute(statement.as_str()).await?;
    }
    info!(table = %table, channel = %channel, "Installed change trigger");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_sql_names() {
        let statements = trigger_sql("audit_log", "nis2_changes").unwrap();
        assert_eq!(statements.len(), 3);

        assert!(statements[0].starts_with("CREATE OR REPLACE FUNCTION notify_audit_log_changes()"));
        assert!(statements[0].contains("pg_notify('nis2_changes', payload::text)"));
        assert_eq!(statements[1], "DROP TRIGGER IF EXISTS trg_audit_log_notify ON audit_log");
        assert!(statements[2].contains("AFTER INSERT OR UPDATE OR DELETE ON audit_log"));
        assert!(statements[2].ends_with("EXECUTE FUNCTION notify_audit_log_changes()"));
    }

    #[test]
    fn test_delete_publishes_deleted_row_as_data() {
        let function = &trigger_sql("orders", "c").unwrap()[0];
        let delete_branch = &function[function.find("'DELETE'").unwrap()..function.find("ELSIF").unwrap()];
        assert!(delete_branch.contains("'data', row_to_json(OLD)"));
        assert!(delete_branch.contains("'old_data', row_to_json(OLD)"));
    }

    #[test]
    fn test_rejects_unsafe_identifiers() {
        for table in ["", "1orders", "orders; DROP TABLE x", "public.orders", "ordérs", "a\"b"] {
            assert!(
                matches!(trigger_sql(table, "chan"), Err(ReplicatorError::Config(_))),
                "{table:?}"
            );
        }
        assert!(trigger_sql("orders", "chan'); --").is_err());
        assert!(trigger_sql(&"t".repeat(64), "chan").is_err());
        assert!(trigger_sql(&"t".repeat(63), "_chan_2").is_ok());
    }
}
