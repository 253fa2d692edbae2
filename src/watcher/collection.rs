//! Naming of a watched collection's stream resources.

/// A registered collection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Collection {
    domain: String,
    name: String,
}

impl Collection {
    pub fn new(domain: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `<domain>.COLLECTION.<name>`
    pub fn stream_name(&self) -> String {
        format!("{}.COLLECTION.{}", self.domain, self.name)
    }

    /// Subject pattern the stream captures.
    pub fn stream_subjects(&self) -> Vec<String> {
        vec![format!("{}.>", self.stream_name())]
    }

    /// Event subject filter of one partition.
    pub fn partition_subject(&self, partition: u64) -> String {
        format!("{}.{}.EVENT.*", self.stream_name(), partition)
    }

    /// Durable consumer name of one partition.
    pub fn durable_name(&self, partition: u64) -> String {
        format!("{}-{}-{}-SNAPSHOT", self.domain, self.name, partition)
    }
}
