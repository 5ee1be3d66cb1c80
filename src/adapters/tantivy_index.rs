//! Tantivy Search Index Adapter
//!
//! Implements the `SearchIndex` port with an embedded Tantivy index, either
//! in RAM or in a directory.
//!
//! Upserts delete any existing document with the same ID and add the new
//! version inside one commit, so replaying a batch leaves the index unchanged.
//! A document whose `update_time` is older than the indexed one is skipped,
//! which keeps a late redelivery from rolling an item back. A failed batch is
//! rolled back as a whole.
//!
//! The writer, and with it the directory lock, is only taken on the first
//! upsert. Read-only users of a directory index can open it alongside a
//! running writer.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tantivy::collector::{Count, TopDocs};
use tantivy::directory::MmapDirectory;
use tantivy::query::{AllQuery, BooleanQuery, Occur, Query, QueryParser, TermQuery};
use tantivy::schema::{
    Field, IndexRecordOption, Schema, Value, FAST, INDEXED, STORED, STRING, TEXT,
};
use tantivy::{
    DocAddress, Index, IndexReader, IndexWriter, Order, ReloadPolicy, Searcher, TantivyDocument,
    Term,
};
use tracing::{debug, info};

use crate::domain::ports::{IndexDocument, SearchIndex, SearchPage, SearchQuery, SortOrder};
use crate::error::{Error, Result};

const WRITER_HEAP_BYTES: usize = 50_000_000;

#[derive(Debug, Clone, Copy)]
struct Fields {
    id: Field,
    title: Field,
    content: Field,
    tags: Field,
    answer: Field,
    user_id: Field,
    edit_time: Field,
    create_time: Field,
    update_time: Field,
    is_delete: Field,
}

impl Fields {
    fn from_schema(schema: &Schema) -> Result<Self> {
        Ok(Self {
            id: schema.get_field("id")?,
            title: schema.get_field("title")?,
            content: schema.get_field("content")?,
            tags: schema.get_field("tags")?,
            answer: schema.get_field("answer")?,
            user_id: schema.get_field("user_id")?,
            edit_time: schema.get_field("edit_time")?,
            create_time: schema.get_field("create_time")?,
            update_time: schema.get_field("update_time")?,
            is_delete: schema.get_field("is_delete")?,
        })
    }
}

fn build_schema() -> Schema {
    let mut builder = Schema::builder();
    builder.add_u64_field("id", INDEXED | STORED | FAST);
    builder.add_text_field("title", TEXT | STORED);
    builder.add_text_field("content", TEXT | STORED);
    builder.add_text_field("tags", STRING | STORED);
    builder.add_text_field("answer", TEXT | STORED);
    builder.add_u64_field("user_id", INDEXED | STORED | FAST);
    builder.add_i64_field("edit_time", STORED | FAST);
    builder.add_i64_field("create_time", STORED | FAST);
    builder.add_i64_field("update_time", STORED | FAST);
    builder.add_u64_field("is_delete", INDEXED | STORED | FAST);
    builder.build()
}

struct Inner {
    index: Index,
    reader: IndexReader,
    writer: Mutex<Option<IndexWriter>>,
    fields: Fields,
}

impl Inner {
    fn encode(&self, doc: &IndexDocument) -> TantivyDocument {
        let f = &self.fields;
        let mut out = TantivyDocument::default();
        out.add_u64(f.id, doc.id);
        out.add_text(f.title, &doc.title);
        out.add_text(f.content, &doc.content);
        for tag in &doc.tags {
            out.add_text(f.tags, tag);
        }
        out.add_text(f.answer, &doc.answer);
        out.add_u64(f.user_id, doc.user_id);
        out.add_i64(f.edit_time, doc.edit_time.timestamp_millis());
        out.add_i64(f.create_time, doc.create_time.timestamp_millis());
        out.add_i64(f.update_time, doc.update_time.timestamp_millis());
        out.add_u64(f.is_delete, u64::from(doc.is_delete));
        out
    }

    fn decode(&self, doc: &TantivyDocument) -> IndexDocument {
        let f = &self.fields;
        let text = |field: Field| {
            doc.get_first(field)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        let number = |field: Field| doc.get_first(field).and_then(|v| v.as_u64()).unwrap_or(0);
        let time = |field: Field| -> DateTime<Utc> {
            doc.get_first(field)
                .and_then(|v| v.as_i64())
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .unwrap_or_default()
        };

        IndexDocument {
            id: number(f.id),
            title: text(f.title),
            content: text(f.content),
            tags: doc
                .get_all(f.tags)
                .filter_map(|v| v.as_str())
                .map(str::to_string)
                .collect(),
            answer: text(f.answer),
            user_id: number(f.user_id),
            edit_time: time(f.edit_time),
            create_time: time(f.create_time),
            update_time: time(f.update_time),
            is_delete: u8::from(number(f.is_delete) != 0),
        }
    }

    /// `update_time` (ms) of the indexed version of `id`.
    fn indexed_version(&self, searcher: &Searcher, id: u64) -> Result<Option<i64>> {
        let query = TermQuery::new(
            Term::from_field_u64(self.fields.id, id),
            IndexRecordOption::Basic,
        );
        let Some((_, addr)) = searcher.search(&query, &TopDocs::with_limit(1))?.pop() else {
            return Ok(None);
        };
        let doc = searcher.doc::<TantivyDocument>(addr)?;
        Ok(doc.get_first(self.fields.update_time).and_then(|v| v.as_i64()))
    }

    /// Stage every document that is not older than the version it replaces.
    /// Returns the number skipped.
    fn stage(&self, writer: &mut IndexWriter, documents: &[IndexDocument]) -> Result<usize> {
        let searcher = self.reader.searcher();
        let mut staged: HashMap<u64, i64> = HashMap::new();
        let mut skipped = 0;

        for doc in documents {
            let incoming = doc.update_time.timestamp_millis();
            let current = match staged.get(&doc.id) {
                Some(version) => Some(*version),
                None => self.indexed_version(&searcher, doc.id)?,
            };
            if current.is_some_and(|version| version > incoming) {
                debug!(id = doc.id, incoming, current = ?current, "Skipping stale document");
                skipped += 1;
                continue;
            }

            writer.delete_term(Term::from_field_u64(self.fields.id, doc.id));
            writer.add_document(self.encode(doc))?;
            staged.insert(doc.id, incoming);
        }

        Ok(skipped)
    }

    fn upsert(&self, documents: &[IndexDocument]) -> Result<usize> {
        let mut guard = self.writer.lock();
        if guard.is_none() {
            *guard = Some(self.index.writer(WRITER_HEAP_BYTES)?);
            debug!("Index writer opened");
        }
        let writer = guard
            .as_mut()
            .ok_or_else(|| Error::Internal("index writer missing".to_string()))?;

        let outcome = self.stage(writer, documents).and_then(|skipped| {
            writer.commit()?;
            Ok(skipped)
        });
        let skipped = match outcome {
            Ok(skipped) => skipped,
            Err(e) => {
                writer.rollback()?;
                return Err(e);
            }
        };

        // Next batch reads indexed versions from this reader
        self.reader.reload()?;
        Ok(skipped)
    }

    fn load(&self, addresses: impl IntoIterator<Item = DocAddress>) -> Result<Vec<IndexDocument>> {
        let searcher = self.reader.searcher();
        addresses
            .into_iter()
            .map(|addr| {
                let doc = searcher.doc::<TantivyDocument>(addr)?;
                Ok(self.decode(&doc))
            })
            .collect()
    }

    fn get(&self, id: u64) -> Result<Option<IndexDocument>> {
        let query = TermQuery::new(
            Term::from_field_u64(self.fields.id, id),
            IndexRecordOption::Basic,
        );
        let top = self
            .reader
            .searcher()
            .search(&query, &TopDocs::with_limit(1))?;
        Ok(self.load(top.into_iter().map(|(_, addr)| addr))?.pop())
    }

    fn build_query(&self, request: &SearchQuery) -> Box<dyn Query> {
        let f = &self.fields;
        let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();

        if let Some(text) = request.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            let parser = QueryParser::for_index(&self.index, vec![f.title, f.content, f.answer]);
            let (parsed, errors) = parser.parse_query_lenient(text);
            if !errors.is_empty() {
                debug!(query = text, errors = errors.len(), "Lenient query parse dropped terms");
            }
            clauses.push((Occur::Must, parsed));
        }

        for tag in &request.tags {
            clauses.push((
                Occur::Must,
                Box::new(TermQuery::new(
                    Term::from_field_text(f.tags, tag),
                    IndexRecordOption::Basic,
                )),
            ));
        }

        if let Some(user_id) = request.user_id {
            clauses.push((
                Occur::Must,
                Box::new(TermQuery::new(
                    Term::from_field_u64(f.user_id, user_id.as_u64()),
                    IndexRecordOption::Basic,
                )),
            ));
        }

        if !request.include_deleted {
            clauses.push((
                Occur::Must,
                Box::new(TermQuery::new(
                    Term::from_field_u64(f.is_delete, 0),
                    IndexRecordOption::Basic,
                )),
            ));
        }

        if clauses.is_empty() {
            Box::new(AllQuery)
        } else {
            Box::new(BooleanQuery::new(clauses))
        }
    }

    fn search(&self, request: &SearchQuery) -> Result<SearchPage> {
        let query = self.build_query(request);
        let searcher = self.reader.searcher();

        if request.size == 0 {
            let total = searcher.search(query.as_ref(), &Count)?;
            return Ok(SearchPage {
                total: total as u64,
                hits: Vec::new(),
            });
        }

        let top = TopDocs::with_limit(request.size).and_offset(request.offset);
        let (total, addresses): (usize, Vec<DocAddress>) = match request.sort {
            SortOrder::Relevance => {
                let (total, docs) = searcher.search(query.as_ref(), &(Count, top))?;
                (total, docs.into_iter().map(|(_, addr)| addr).collect())
            }
            SortOrder::UpdateTimeDesc | SortOrder::CreateTimeDesc => {
                let field = if request.sort == SortOrder::UpdateTimeDesc {
                    "update_time"
                } else {
                    "create_time"
                };
                let (total, docs) = searcher.search(
                    query.as_ref(),
                    &(Count, top.order_by_fast_field::<i64>(field, Order::Desc)),
                )?;
                (total, docs.into_iter().map(|(_, addr)| addr).collect())
            }
        };

        Ok(SearchPage {
            total: total as u64,
            hits: self.load(addresses)?,
        })
    }
}

/// Search index backed by Tantivy.
#[derive(Clone)]
pub struct TantivySearchIndex {
    inner: Arc<Inner>,
}

impl TantivySearchIndex {
    /// Create an empty index held in RAM.
    pub fn in_memory() -> Result<Self> {
        Self::from_index(Index::create_in_ram(build_schema()))
    }

    /// Open the index in `path`, creating it if the directory is empty.
    pub fn open_or_create(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)?;
        let directory = MmapDirectory::open(path)
            .map_err(|e| Error::Index(format!("Failed to open index directory: {}", e)))?;
        let index = Index::open_or_create(directory, build_schema())?;
        info!(path = %path.display(), "Opened search index");
        Self::from_index(index)
    }

    fn from_index(index: Index) -> Result<Self> {
        let fields = Fields::from_schema(&index.schema())?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;

        Ok(Self {
            inner: Arc::new(Inner {
                index,
                reader,
                writer: Mutex::new(None),
                fields,
            }),
        })
    }

    /// Number of live (searchable) documents, deleted ones included.
    pub fn num_docs(&self) -> u64 {
        self.inner.reader.searcher().num_docs()
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| Error::Internal(format!("Index task failed: {}", e)))?
    }
}

#[async_trait]
impl SearchIndex for TantivySearchIndex {
    async fn upsert(&self, documents: &[IndexDocument]) -> Result<()> {
        if documents.is_empty() {
            return Ok(());
        }
        let documents = documents.to_vec();
        let count = documents.len();
        let skipped = self.blocking(move |inner| inner.upsert(&documents)).await?;
        debug!(count, skipped, "Upserted documents");
        Ok(())
    }

    async fn get(&self, id: u64) -> Result<Option<IndexDocument>> {
        self.blocking(move |inner| inner.get(id)).await
    }

    async fn search(&self, query: &SearchQuery) -> Result<SearchPage> {
        let query = query.clone();
        self.blocking(move |inner| inner.search(&query)).await
    }
}
