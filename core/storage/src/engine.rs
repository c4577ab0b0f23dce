//! Storage engine trait definition.

use async_trait::async_trait;

use sehatlink_common::{Error, Result};

/// Storage engine trait for different backends.
///
/// An engine persists named tables as opaque byte documents. Callers
/// serialize whole tables; the engine only guarantees that a table read never
/// observes a partially written table.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Get the engine name (e.g., "memory", "local").
    fn name(&self) -> &str;

    /// Read a table.
    ///
    /// # Returns
    /// `None` if the table has never been written.
    ///
    /// # Errors
    /// - `StorageUnavailable` if the engine cannot be read
    async fn read_table(&self, table: &str) -> Result<Option<Vec<u8>>>;

    /// Replace the contents of a table.
    ///
    /// # Postconditions
    /// - A subsequent `read_table` returns exactly `data`
    ///
    /// # Errors
    /// - `StorageUnavailable` on quota exhaustion, disabled storage or I/O failure
    async fn write_table(&self, table: &str, data: Vec<u8>) -> Result<()>;

    /// List the names of all written tables.
    async fn list_tables(&self) -> Result<Vec<String>>;
}

/// Check that a table name is usable by every engine.
///
/// Names become file names for the local engine, so only lowercase ASCII
/// letters, digits and underscores are accepted.
pub fn validate_table_name(table: &str) -> Result<()> {
    if table.is_empty() {
        return Err(Error::InvalidInput("Table name cannot be empty".to_string()));
    }
    if !table
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(Error::InvalidInput(format!(
            "Invalid table name: {}",
            table
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_names() {
        assert!(validate_table_name("offline_data").is_ok());
        assert!(validate_table_name("symptom_checks").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("../etc").is_err());
        assert!(validate_table_name("Reminders").is_err());
    }
}
