//! Semantic retrieval over insight statements.
//!
//! A pluggable [`SemanticIndex`] with two implementations: a full-text index
//! with BM25 scoring, stemming, and fuzzy fallback, and a keyword-overlap
//! fallback selected when `KAIT_EMBEDDINGS=0` disables the index.

use std::collections::HashSet;

use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, FuzzyTermQuery, Occur, Query, QueryParser};
use tantivy::schema::{
    Field, IndexRecordOption, Schema, TextFieldIndexing, TextOptions, Value, STORED, STRING,
};
use tantivy::tokenizer::TextAnalyzer;
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};

use crate::cognitive::{normalize_statement, Insight};
use crate::error::{KaitError, Result};

/// Field boosts for the full-text index.
const STATEMENT_BOOST: f32 = 2.0;
const CATEGORY_BOOST: f32 = 1.0;

/// Heap for the index writer. Small: the corpus is hundreds of statements.
const INDEX_WRITER_HEAP_SIZE: usize = 15_000_000;

/// A scored match: insight key plus relevance.
pub type SemanticMatch = (String, f64);

/// Pluggable semantic retrieval over insight statements.
pub trait SemanticIndex: Send + Sync {
    /// Name for logs and the decision ledger.
    fn name(&self) -> &'static str;

    /// Replace the indexed corpus.
    fn reindex(&mut self, insights: &[Insight]) -> Result<()>;

    /// Search for the top `k` matches.
    fn search(&self, query: &str, k: usize) -> Result<Vec<SemanticMatch>>;
}

/// Keyword-overlap fallback index.
///
/// Scores by the fraction of query tokens present in the statement, which is
/// cheap, deterministic, and dependency-free at query time.
#[derive(Debug, Default)]
pub struct KeywordSemanticIndex {
    docs: Vec<(String, HashSet<String>)>,
}

impl KeywordSemanticIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SemanticIndex for KeywordSemanticIndex {
    fn name(&self) -> &'static str {
        "keyword"
    }

    fn reindex(&mut self, insights: &[Insight]) -> Result<()> {
        self.docs = insights
            .iter()
            .map(|i| {
                let tokens = normalize_statement(&i.statement)
                    .split_whitespace()
                    .map(str::to_string)
                    .collect();
                (i.key.clone(), tokens)
            })
            .collect();
        Ok(())
    }

    fn search(&self, query: &str, k: usize) -> Result<Vec<SemanticMatch>> {
        let query_tokens: Vec<String> = normalize_statement(query)
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if query_tokens.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<SemanticMatch> = self
            .docs
            .iter()
            .filter_map(|(key, tokens)| {
                let hits = query_tokens.iter().filter(|t| tokens.contains(*t)).count();
                if hits == 0 {
                    return None;
                }
                Some((key.clone(), hits as f64 / query_tokens.len() as f64))
            })
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }
}

/// Full-text index over insight statements.
pub struct TantivySemanticIndex {
    index: Index,
    reader: IndexReader,
    key_field: Field,
    statement_field: Field,
    category_field: Field,
}

impl TantivySemanticIndex {
    /// Create a new in-memory index.
    pub fn in_memory() -> Result<Self> {
        let schema = Self::build_schema();
        let index = Index::create_in_ram(schema.clone());
        Self::register_tokenizers(&index);

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()
            .map_err(|e| KaitError::store(format!("failed to create index reader: {}", e)))?;

        Ok(Self {
            index,
            reader,
            key_field: schema.get_field("key").expect("schema must have key field"),
            statement_field: schema
                .get_field("statement")
                .expect("schema must have statement field"),
            category_field: schema
                .get_field("category")
                .expect("schema must have category field"),
        })
    }

    fn build_schema() -> Schema {
        let mut schema_builder = Schema::builder();

        // Key is stored and indexed without tokenization for delete-by-key
        schema_builder.add_text_field("key", STRING | STORED);

        let text_options = TextOptions::default().set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer("en_stem")
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        );
        schema_builder.add_text_field("statement", text_options.clone());
        schema_builder.add_text_field("category", text_options);

        schema_builder.build()
    }

    fn register_tokenizers(index: &Index) {
        let tokenizer = TextAnalyzer::builder(tantivy::tokenizer::SimpleTokenizer::default())
            .filter(tantivy::tokenizer::LowerCaser)
            .filter(tantivy::tokenizer::Stemmer::new(
                tantivy::tokenizer::Language::English,
            ))
            .build();
        index.tokenizers().register("en_stem", tokenizer);
    }

    fn stemmed_search(&self, query_str: &str, k: usize) -> Result<Vec<SemanticMatch>> {
        let searcher = self.reader.searcher();

        let mut query_parser = QueryParser::for_index(
            &self.index,
            vec![self.statement_field, self.category_field],
        );
        query_parser.set_field_boost(self.statement_field, STATEMENT_BOOST);
        query_parser.set_field_boost(self.category_field, CATEGORY_BOOST);

        let escaped = escape_query(query_str);
        let query = query_parser
            .parse_query(&escaped)
            .map_err(|e| KaitError::store(format!("failed to parse query: {}", e)))?;

        self.execute(&searcher, &*query, k)
    }

    fn fuzzy_search(&self, query_str: &str, k: usize) -> Result<Vec<SemanticMatch>> {
        let searcher = self.reader.searcher();
        let fields = [self.statement_field, self.category_field];

        let mut subqueries: Vec<(Occur, Box<dyn Query>)> = Vec::new();
        for term_str in query_str.split_whitespace() {
            let term_lower = term_str.to_lowercase();
            // Short terms fuzz too aggressively with distance 2
            let distance = if term_lower.len() <= 4 { 1 } else { 2 };

            let mut field_queries: Vec<(Occur, Box<dyn Query>)> = Vec::new();
            for field in &fields {
                let term = Term::from_field_text(*field, &term_lower);
                field_queries.push((
                    Occur::Should,
                    Box::new(FuzzyTermQuery::new(term, distance, true)),
                ));
            }
            subqueries.push((Occur::Should, Box::new(BooleanQuery::new(field_queries))));
        }

        let query = BooleanQuery::new(subqueries);
        self.execute(&searcher, &query, k)
    }

    fn execute(
        &self,
        searcher: &tantivy::Searcher,
        query: &dyn Query,
        k: usize,
    ) -> Result<Vec<SemanticMatch>> {
        let top_docs = searcher
            .search(query, &TopDocs::with_limit(k))
            .map_err(|e| KaitError::store(format!("semantic search failed: {}", e)))?;

        let mut results = Vec::new();
        for (score, doc_address) in top_docs {
            let doc: TantivyDocument = searcher
                .doc(doc_address)
                .map_err(|e| KaitError::store(format!("failed to retrieve doc: {}", e)))?;
            if let Some(key) = doc.get_first(self.key_field).and_then(|v| v.as_str()) {
                results.push((key.to_string(), score as f64));
            }
        }
        Ok(results)
    }
}

impl SemanticIndex for TantivySemanticIndex {
    fn name(&self) -> &'static str {
        "tantivy"
    }

    fn reindex(&mut self, insights: &[Insight]) -> Result<()> {
        let mut writer: IndexWriter = self
            .index
            .writer(INDEX_WRITER_HEAP_SIZE)
            .map_err(|e| KaitError::store(format!("failed to allocate index writer: {}", e)))?;

        for insight in insights {
            let key_term = Term::from_field_text(self.key_field, &insight.key);
            writer.delete_term(key_term);
            writer
                .add_document(doc!(
                    self.key_field => insight.key.clone(),
                    self.statement_field => insight.statement.clone(),
                    self.category_field => insight.category.as_str().to_string(),
                ))
                .map_err(|e| KaitError::store(format!("failed to add document: {}", e)))?;
        }

        writer
            .commit()
            .map_err(|e| KaitError::store(format!("failed to commit index: {}", e)))?;
        self.reader
            .reload()
            .map_err(|e| KaitError::store(format!("failed to reload reader: {}", e)))?;
        Ok(())
    }

    fn search(&self, query: &str, k: usize) -> Result<Vec<SemanticMatch>> {
        if k == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let mut results = self.stemmed_search(query, k)?;

        // Supplement with fuzzy matches when stemming found little
        if results.len() < k {
            let seen: HashSet<String> = results.iter().map(|(key, _)| key.clone()).collect();
            for result in self.fuzzy_search(query, k)? {
                if !seen.contains(&result.0) && results.len() < k {
                    results.push(result);
                }
            }
        }

        Ok(results)
    }
}

/// Escape query-parser special characters so user text is matched literally.
fn escape_query(query: &str) -> String {
    let mut escaped = String::with_capacity(query.len() * 2);
    for c in query.chars() {
        match c {
            '+' | '-' | '!' | '(' | ')' | '{' | '}' | '[' | ']' | '^' | '"' | '~' | '*' | '?'
            | ':' | '\\' | '/' => {
                escaped.push('\\');
                escaped.push(c);
            }
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Build the configured semantic index.
pub fn build_semantic_index(embeddings: bool) -> Box<dyn SemanticIndex> {
    if embeddings {
        match TantivySemanticIndex::in_memory() {
            Ok(index) => return Box::new(index),
            Err(err) => {
                tracing::warn!("full-text index unavailable, using keyword fallback: {}", err);
            }
        }
    }
    Box::new(KeywordSemanticIndex::new())
}
