use std::fmt;

/// Identity of one logical connection: the capture partition it was seen
/// on plus the connection id, which is only unique within that partition.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey {
    partition_id: String,
    connection_id: String,
}

impl ConnectionKey {
    /// # Panics
    ///
    /// Panics if `connection_id` is empty.
    pub fn new(partition_id: impl Into<String>, connection_id: impl Into<String>) -> Self {
        let connection_id = connection_id.into();
        assert!(!connection_id.is_empty(), "connection_id must not be empty");
        ConnectionKey {
            partition_id: partition_id.into(),
            connection_id,
        }
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.partition_id, self.connection_id)
    }
}
