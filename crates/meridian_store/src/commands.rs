//! Stored-procedure interpreter.
//!
//! Procedures are line-oriented command lists executed against the
//! transaction's buffered key state. The interpreter is pure over the buffer:
//! it never touches storage, and writes or deletes apply only to keys the
//! transaction declared as WRITE. Targets outside the declared set are
//! ignored so a procedure cannot widen its own footprint.

use crate::transaction::{AbortReason, KeyType, Procedure, Transaction, TransactionStatus};

/// Interpreter for `Procedure::Code` transactions.
#[derive(Default)]
pub struct KeyValueCommands;

impl KeyValueCommands {
    pub fn new() -> Self {
        Self
    }

    /// Run the procedure, setting the transaction's final status. A remaster
    /// has no code to run; its effect happens at commit.
    pub fn execute(&self, txn: &mut Transaction) {
        let code = match &txn.procedure {
            Procedure::Code(code) => code.clone(),
            Procedure::Remaster { .. } => {
                txn.status = TransactionStatus::Committed;
                return;
            }
        };

        for line in code.lines() {
            let mut tokens = line.split_whitespace();
            let Some(command) = tokens.next() else {
                continue;
            };
            let result = match command {
                "GET" => self.get(txn, tokens.next()),
                "SET" => self.set(txn, tokens.next(), tokens.next()),
                "DEL" => self.del(txn, tokens.next()),
                "COPY" => self.copy(txn, tokens.next(), tokens.next()),
                other => Err(format!("unknown command: {other}")),
            };
            if let Err(message) = result {
                txn.abort(AbortReason::Execute(message));
                return;
            }
        }
        txn.status = TransactionStatus::Committed;
    }

    fn get(&self, _txn: &Transaction, key: Option<&str>) -> Result<(), String> {
        // The value is already buffered by the read phase; GET only checks
        // arity so malformed procedures fail loudly.
        key.map(|_| ()).ok_or_else(|| "GET requires a key".into())
    }

    fn set(&self, txn: &mut Transaction, key: Option<&str>, value: Option<&str>) -> Result<(), String> {
        let key = key.ok_or_else(|| String::from("SET requires a key"))?;
        let value = value.ok_or_else(|| String::from("SET requires a value"))?;
        if let Some(entry) = txn.keys.get_mut(key) {
            if entry.key_type == KeyType::Write {
                entry.new_value = Some(value.to_string());
                entry.deleted = false;
            }
        }
        Ok(())
    }

    fn del(&self, txn: &mut Transaction, key: Option<&str>) -> Result<(), String> {
        let key = key.ok_or_else(|| String::from("DEL requires a key"))?;
        if let Some(entry) = txn.keys.get_mut(key) {
            if entry.key_type == KeyType::Write {
                entry.deleted = true;
                entry.new_value = None;
            }
        }
        Ok(())
    }

    fn copy(&self, txn: &mut Transaction, src: Option<&str>, dst: Option<&str>) -> Result<(), String> {
        let src = src.ok_or_else(|| String::from("COPY requires a source key"))?;
        let dst = dst.ok_or_else(|| String::from("COPY requires a destination key"))?;
        let Some(value) = txn.keys.get(src).map(|entry| entry.value.clone()) else {
            return Ok(());
        };
        if let Some(entry) = txn.keys.get_mut(dst) {
            if entry.key_type == KeyType::Write {
                entry.new_value = Some(value);
                entry.deleted = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::transaction::KeyEntry;
    use crate::types::Metadata;

    fn txn_with(keys: Vec<(&str, KeyEntry)>, code: &str) -> Transaction {
        let keys: BTreeMap<_, _> = keys
            .into_iter()
            .map(|(k, mut e)| {
                e.metadata = Some(Metadata::default());
                (k.to_string(), e)
            })
            .collect();
        Transaction::new(keys, Procedure::Code(code.to_string()))
    }

    #[test]
    fn set_and_del_apply_to_declared_writes() {
        let mut txn = txn_with(
            vec![
                ("key1", KeyEntry::write()),
                ("key2", KeyEntry::write()),
                ("key3", KeyEntry::write()),
            ],
            "SET key1 value1\nSET key2 value2\nDEL key3",
        );
        KeyValueCommands::new().execute(&mut txn);

        assert_eq!(txn.status, TransactionStatus::Committed);
        assert_eq!(txn.keys["key1"].new_value.as_deref(), Some("value1"));
        assert_eq!(txn.keys["key2"].new_value.as_deref(), Some("value2"));
        assert!(txn.keys["key3"].deleted);
    }

    #[test]
    fn malformed_command_aborts() {
        let mut txn = txn_with(vec![("key1", KeyEntry::write())], "SET key1");
        KeyValueCommands::new().execute(&mut txn);
        assert_eq!(txn.status, TransactionStatus::Aborted);
        assert!(matches!(txn.abort_reason, Some(AbortReason::Execute(_))));
    }

    #[test]
    fn writes_outside_the_declared_write_set_are_ignored() {
        let mut txn = txn_with(
            vec![("key1", KeyEntry::write())],
            "SET key1 v1\nSET key2 v2\nDEL key3",
        );
        KeyValueCommands::new().execute(&mut txn);

        assert_eq!(txn.status, TransactionStatus::Committed);
        assert_eq!(txn.keys["key1"].new_value.as_deref(), Some("v1"));
        assert!(!txn.keys.contains_key("key2"));
        assert!(!txn.keys.contains_key("key3"));
    }

    #[test]
    fn read_only_keys_cannot_be_written() {
        let mut txn = txn_with(vec![("key1", KeyEntry::read())], "SET key1 v1");
        KeyValueCommands::new().execute(&mut txn);
        assert_eq!(txn.status, TransactionStatus::Committed);
        assert_eq!(txn.keys["key1"].new_value, None);
    }

    #[test]
    fn copy_moves_the_buffered_value() {
        let mut txn = txn_with(
            vec![("src", KeyEntry::read()), ("dst", KeyEntry::write())],
            "COPY src dst",
        );
        txn.keys.get_mut("src").unwrap().value = "payload".into();
        KeyValueCommands::new().execute(&mut txn);

        assert_eq!(txn.status, TransactionStatus::Committed);
        assert_eq!(txn.keys["dst"].new_value.as_deref(), Some("payload"));
    }

    #[test]
    fn unknown_command_aborts() {
        let mut txn = txn_with(vec![("key1", KeyEntry::write())], "FROB key1");
        KeyValueCommands::new().execute(&mut txn);
        assert_eq!(txn.status, TransactionStatus::Aborted);
    }
}
