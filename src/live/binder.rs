//! Query binding: resolves the tables a live query reads.
//!
//! A live query is declared through [`LiveQueryBuilder`]: one base table,
//! any number of joined tables, and relation paths walked from the base
//! table (`"people.messages"`). The builder resolves all of them against the
//! schema's relation graph and produces a [`DependencySet`]. A query whose
//! source cannot be resolved to tables is rejected at build time.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use rusqlite::Connection;
use serde::Serialize;

use crate::db::DbError;
use crate::error::CoreError;

/// Tables of the message store that live queries can depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Export,
    CanonicalPerson,
    CanonicalConversation,
    Conversation,
    Person,
    Message,
    MessageText,
    MessageImage,
    MessageVideo,
    MessageGif,
    MessageAudio,
    Reaction,
}

impl Table {
    pub const ALL: [Table; 12] = [
        Table::Export,
        Table::CanonicalPerson,
        Table::CanonicalConversation,
        Table::Conversation,
        Table::Person,
        Table::Message,
        Table::MessageText,
        Table::MessageImage,
        Table::MessageVideo,
        Table::MessageGif,
        Table::MessageAudio,
        Table::Reaction,
    ];

    /// SQL table name.
    pub fn name(self) -> &'static str {
        match self {
            Table::Export => "export",
            Table::CanonicalPerson => "canonical_person",
            Table::CanonicalConversation => "canonical_conversation",
            Table::Conversation => "conversation",
            Table::Person => "person",
            Table::Message => "message",
            Table::MessageText => "message_text",
            Table::MessageImage => "message_image",
            Table::MessageVideo => "message_video",
            Table::MessageGif => "message_gif",
            Table::MessageAudio => "message_audio",
            Table::Reaction => "reaction",
        }
    }

    /// Look up a table by its SQL name. Bookkeeping tables such as
    /// `schema_version` return `None`.
    pub fn from_name(name: &str) -> Option<Table> {
        Table::ALL.into_iter().find(|t| t.name() == name)
    }

    /// Follow a named relation from this table.
    pub fn relation(self, relation: &str) -> Option<Table> {
        let target = match (self, relation) {
            (Table::Export, "conversations") => Table::Conversation,
            (Table::CanonicalPerson, "people") => Table::Person,
            (Table::CanonicalConversation, "conversations") => Table::Conversation,
            (Table::Conversation, "export") => Table::Export,
            (Table::Conversation, "canonical") => Table::CanonicalConversation,
            (Table::Conversation, "people") => Table::Person,
            (Table::Person, "conversation") => Table::Conversation,
            (Table::Person, "canonical") => Table::CanonicalPerson,
            (Table::Person, "messages") => Table::Message,
            (Table::Person, "reactions") => Table::Reaction,
            (Table::Message, "sender") => Table::Person,
            (Table::Message, "texts") => Table::MessageText,
            (Table::Message, "images") => Table::MessageImage,
            (Table::Message, "videos") => Table::MessageVideo,
            (Table::Message, "gifs") => Table::MessageGif,
            (Table::Message, "audios") => Table::MessageAudio,
            (Table::Message, "reactions") => Table::Reaction,
            (
                Table::MessageText
                | Table::MessageImage
                | Table::MessageVideo
                | Table::MessageGif
                | Table::MessageAudio,
                "message",
            ) => Table::Message,
            (Table::Reaction, "message") => Table::Message,
            (Table::Reaction, "reactor") => Table::Person,
            _ => return None,
        };
        Some(target)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The set of tables whose changes must re-run a live query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DependencySet(BTreeSet<Table>);

impl DependencySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, table: Table) -> bool {
        self.0.insert(table)
    }

    pub fn contains(&self, table: Table) -> bool {
        self.0.contains(&table)
    }

    /// True if any of `tables` is a dependency.
    pub fn intersects<'a>(&self, tables: impl IntoIterator<Item = &'a Table>) -> bool {
        tables.into_iter().any(|t| self.0.contains(t))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = Table> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<Table> for DependencySet {
    fn from_iter<I: IntoIterator<Item = Table>>(iter: I) -> Self {
        DependencySet(iter.into_iter().collect())
    }
}

/// Where a live query reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuerySource {
    Table(Table),
    /// Raw SQL or a computed view whose tables cannot be determined.
    Opaque(String),
}

/// Identity of a live query: two declarations with the same key share one
/// subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub name: String,
    pub params: Vec<String>,
    pub dependencies: DependencySet,
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.params.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}({})", self.name, self.params.join(", "))
        }
    }
}

pub type FetchFn<T> = Arc<dyn Fn(&Connection) -> Result<T, DbError> + Send + Sync>;

/// A bound live query: identity, dependency set and the read it performs.
pub struct LiveQuery<T> {
    key: QueryKey,
    fetch: FetchFn<T>,
}

impl<T> Clone for LiveQuery<T> {
    fn clone(&self) -> Self {
        LiveQuery {
            key: self.key.clone(),
            fetch: Arc::clone(&self.fetch),
        }
    }
}

impl<T> fmt::Debug for LiveQuery<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveQuery").field("key", &self.key).finish()
    }
}

impl LiveQuery<()> {
    /// Start declaring a query. The result type is fixed by `build`.
    pub fn builder(name: impl Into<String>) -> LiveQueryBuilder {
        LiveQueryBuilder::new(name)
    }
}

impl<T> LiveQuery<T> {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn dependencies(&self) -> &DependencySet {
        &self.key.dependencies
    }

    pub(crate) fn fetcher(&self) -> FetchFn<T> {
        Arc::clone(&self.fetch)
    }

    /// Run the read once against `conn`.
    pub fn fetch(&self, conn: &Connection) -> Result<T, DbError> {
        (self.fetch)(conn)
    }
}

#[derive(Debug, Clone)]
pub struct LiveQueryBuilder {
    name: String,
    source: Option<QuerySource>,
    joins: Vec<Table>,
    relations: Vec<String>,
    extra: Vec<Table>,
    params: Vec<String>,
}

impl LiveQueryBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        LiveQueryBuilder {
            name: name.into(),
            source: None,
            joins: Vec::new(),
            relations: Vec::new(),
            extra: Vec::new(),
            params: Vec::new(),
        }
    }

    pub fn from(mut self, table: Table) -> Self {
        self.source = Some(QuerySource::Table(table));
        self
    }

    /// Declare a source whose tables are unknown. `build` rejects it.
    pub fn from_opaque(mut self, description: impl Into<String>) -> Self {
        self.source = Some(QuerySource::Opaque(description.into()));
        self
    }

    pub fn join(mut self, table: Table) -> Self {
        self.joins.push(table);
        self
    }

    /// Include a relation path walked from the base table, e.g. `"people.messages"`.
    pub fn with_relation(mut self, path: impl Into<String>) -> Self {
        self.relations.push(path.into());
        self
    }

    /// Add a table the read touches outside of joins and relations,
    /// such as one referenced only in a correlated subquery.
    pub fn depends_on(mut self, table: Table) -> Self {
        self.extra.push(table);
        self
    }

    /// Add a parameter value to the query identity.
    pub fn param(mut self, value: impl fmt::Display) -> Self {
        self.params.push(value.to_string());
        self
    }

    /// Resolve the dependency set without attaching a read.
    pub fn resolve(&self) -> Result<DependencySet, CoreError> {
        let base = match &self.source {
            Some(QuerySource::Table(table)) => *table,
            Some(QuerySource::Opaque(description)) => {
                return Err(CoreError::subscription(format!(
                    "'{}' reads from {}, which does not resolve to known tables",
                    self.name, description
                )))
            }
            None => {
                return Err(CoreError::subscription(format!(
                    "'{}' has no base table",
                    self.name
                )))
            }
        };

        let mut deps = DependencySet::new();
        deps.insert(base);
        for table in self.joins.iter().chain(self.extra.iter()) {
            deps.insert(*table);
        }

        for path in &self.relations {
            let mut current = base;
            for segment in path.split('.') {
                current = current.relation(segment).ok_or_else(|| {
                    CoreError::subscription(format!(
                        "'{}': {} has no relation '{}' (in path '{}')",
                        self.name, current, segment, path
                    ))
                })?;
                deps.insert(current);
            }
        }

        Ok(deps)
    }

    pub fn build<T, F>(self, fetch: F) -> Result<LiveQuery<T>, CoreError>
    where
        F: Fn(&Connection) -> Result<T, DbError> + Send + Sync + 'static,
    {
        let dependencies = self.resolve()?;
        Ok(LiveQuery {
            key: QueryKey {
                name: self.name,
                params: self.params,
                dependencies,
            },
            fetch: Arc::new(fetch),
        })
    }
}
