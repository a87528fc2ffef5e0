use std::collections::HashMap;

use crate::api::models::{MessageId, ServerId, TempId};

/// Stable handle for a message record, independent of its public id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordKey(u64);

/// Maps both temporary and permanent ids onto record handles.
///
/// A temp id stays resolvable after the ack so that callers holding it keep
/// reaching the same record.
#[derive(Debug, Default)]
pub struct IdentityTable {
    next: u64,
    by_temp: HashMap<TempId, RecordKey>,
    by_server: HashMap<ServerId, RecordKey>,
}

impl IdentityTable {
    pub fn allocate(&mut self) -> RecordKey {
        self.next += 1;
        RecordKey(self.next)
    }

    pub fn bind_temp(&mut self, temp: TempId, key: RecordKey) {
        self.by_temp.insert(temp, key);
    }

    pub fn bind_server(&mut self, id: ServerId, key: RecordKey) {
        self.by_server.insert(id, key);
    }

    pub fn by_temp(&self, temp: TempId) -> Option<RecordKey> {
        self.by_temp.get(&temp).copied()
    }

    pub fn by_server(&self, id: ServerId) -> Option<RecordKey> {
        self.by_server.get(&id).copied()
    }

    pub fn resolve(&self, id: &MessageId) -> Option<RecordKey> {
        match id {
            MessageId::Temp(t) => self.by_temp(*t),
            MessageId::Server(s) => self.by_server(*s),
        }
    }

    /// Drops every id pointing at `key`.
    pub fn forget(&mut self, key: RecordKey) {
        self.by_temp.retain(|_, k| *k != key);
        self.by_server.retain(|_, k| *k != key);
    }

    /// Points every temp id aimed at `from` to `to` instead.
    pub fn redirect_temps(&mut self, from: RecordKey, to: RecordKey) {
        for key in self.by_temp.values_mut() {
            if *key == from {
                *key = to;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_id_keeps_resolving_after_ack() {
        let mut ids = IdentityTable::default();
        let key = ids.allocate();
        let temp = TempId::new();
        ids.bind_temp(temp, key);
        ids.bind_server(ServerId(9), key);

        assert_eq!(ids.resolve(&MessageId::Temp(temp)), Some(key));
        assert_eq!(ids.resolve(&MessageId::Server(ServerId(9))), Some(key));

        ids.forget(key);
        assert_eq!(ids.resolve(&MessageId::Temp(temp)), None);
        assert_eq!(ids.by_server(ServerId(9)), None);
    }

    #[test]
    fn redirect_moves_temps_only() {
        let mut ids = IdentityTable::default();
        let a = ids.allocate();
        let b = ids.allocate();
        let temp = TempId::new();
        ids.bind_temp(temp, a);
        ids.bind_server(ServerId(1), b);
        ids.redirect_temps(a, b);
        assert_eq!(ids.by_temp(temp), Some(b));
        assert_ne!(a, b);
    }
}
