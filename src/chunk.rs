//! Token-bounded text chunker and bulk embedder.
//!
//! Splits document text into [`DocumentChunk`]s of at most
//! `chunk_token_size` tokens, preferring to end a chunk on a sentence
//! boundary, then embeds every chunk of a batch of documents.
//!
//! # Algorithm
//!
//! 1. Whitespace-only text yields no chunks.
//! 2. Encode the text and repeatedly take a window of `chunk_token_size`
//!    tokens from the front, decoding it back to text.
//! 3. A window that decodes to whitespace is dropped and skipped.
//! 4. If the last `.`, `?`, `!` or `\n` in the window lies beyond
//!    [`MIN_CHUNK_SIZE_CHARS`] characters, the window text is cut just after it.
//! 5. The first newline becomes a space and the text is trimmed; it is
//!    kept only if longer than [`MIN_CHUNK_LENGTH_TO_EMBED`] characters.
//! 6. The cursor advances by the token count of the (possibly cut) window
//!    text, so the next window starts exactly where this one ended.
//! 7. After [`MAX_NUM_CHUNKS`] windows, whatever remains becomes one final chunk.
//!
//! Chunk ids are `"<documentId>_<index>"`. Embeddings are requested in
//! batches of [`EMBEDDINGS_BATCH_SIZE`] texts across all input documents and
//! assigned back strictly in chunk order.

use anyhow::{bail, Result};
use std::sync::Arc;
use uuid::Uuid;

use crate::embedding::EmbeddingProvider;
use crate::models::{Document, DocumentChunk, DocumentChunkMetadata};
use crate::tokenizer::Tokenizer;

pub const DEFAULT_CHUNK_TOKEN_SIZE: usize = 200;
/// A boundary earlier than this many characters into the window is ignored.
pub const MIN_CHUNK_SIZE_CHARS: usize = 350;
/// Chunks this short or shorter are discarded.
pub const MIN_CHUNK_LENGTH_TO_EMBED: usize = 5;
pub const EMBEDDINGS_BATCH_SIZE: usize = 128;
pub const MAX_NUM_CHUNKS: usize = 10_000;

const BOUNDARY_CHARS: [char; 4] = ['.', '?', '!', '\n'];

/// Split `text` into chunk texts of at most `chunk_token_size` tokens.
pub fn text_chunks(tokenizer: &dyn Tokenizer, text: &str, chunk_token_size: usize) -> Vec<String> {
    split_text(tokenizer, text, chunk_token_size, MAX_NUM_CHUNKS)
}

fn split_text(
    tokenizer: &dyn Tokenizer,
    text: &str,
    chunk_token_size: usize,
    max_chunks: usize,
) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let chunk_token_size = chunk_token_size.max(1);
    let tokens = tokenizer.encode(text);
    let mut chunks = Vec::new();
    let mut cursor = 0usize;
    let mut num_chunks = 0usize;

    while cursor < tokens.len() && num_chunks < max_chunks {
        let end = (cursor + chunk_token_size).min(tokens.len());
        let mut chunk_text = tokenizer.decode(&tokens[cursor..end]);

        if chunk_text.trim().is_empty() {
            cursor = end;
            continue;
        }

        if let Some(byte_pos) = chunk_text.rfind(&BOUNDARY_CHARS[..]) {
            let char_pos = chunk_text[..byte_pos].chars().count();
            if char_pos > MIN_CHUNK_SIZE_CHARS {
                // Boundary characters are all single-byte.
                chunk_text.truncate(byte_pos + 1);
            }
        }

        let normalized = normalize(&chunk_text);
        if normalized.chars().count() > MIN_CHUNK_LENGTH_TO_EMBED {
            chunks.push(normalized);
        }

        let consumed = tokenizer.encode(&chunk_text).len().max(1);
        cursor = (cursor + consumed).min(tokens.len());
        num_chunks += 1;
    }

    if cursor < tokens.len() {
        let remaining = normalize(&tokenizer.decode(&tokens[cursor..]));
        if remaining.chars().count() > MIN_CHUNK_LENGTH_TO_EMBED {
            chunks.push(remaining);
        }
    }

    chunks
}

fn normalize(text: &str) -> String {
    text.replacen('\n', " ", 1).trim().to_string()
}

/// The chunks produced for one input document.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkedDocument {
    pub document_id: String,
    /// Empty for documents without embeddable text.
    pub chunks: Vec<DocumentChunk>,
}

/// Chunks documents and attaches embeddings.
pub struct ChunkingEngine {
    tokenizer: Arc<dyn Tokenizer>,
    embedder: Arc<dyn EmbeddingProvider>,
    chunk_token_size: usize,
    batch_size: usize,
}

impl ChunkingEngine {
    pub fn new(tokenizer: Arc<dyn Tokenizer>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            tokenizer,
            embedder,
            chunk_token_size: DEFAULT_CHUNK_TOKEN_SIZE,
            batch_size: EMBEDDINGS_BATCH_SIZE,
        }
    }

    /// Default window size used when a call does not pass one.
    pub fn with_chunk_token_size(mut self, chunk_token_size: usize) -> Self {
        self.chunk_token_size = chunk_token_size.max(1);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    /// Chunk a single document without embedding it.
    ///
    /// Returns the document id (generated if the document has none) and its
    /// chunks; whitespace-only text yields no chunks.
    pub fn create_document_chunks(
        &self,
        doc: &Document,
        chunk_token_size: Option<usize>,
    ) -> ChunkedDocument {
        let document_id = doc
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if doc.text.trim().is_empty() {
            return ChunkedDocument {
                document_id,
                chunks: Vec::new(),
            };
        }

        let size = chunk_token_size.unwrap_or(self.chunk_token_size);
        let metadata = DocumentChunkMetadata {
            base: doc.metadata.clone(),
            document_id: document_id.clone(),
        };

        let chunks = text_chunks(self.tokenizer.as_ref(), &doc.text, size)
            .into_iter()
            .enumerate()
            .map(|(i, text)| DocumentChunk {
                id: format!("{}_{}", document_id, i),
                text,
                metadata: metadata.clone(),
                embedding: None,
            })
            .collect();

        ChunkedDocument {
            document_id,
            chunks,
        }
    }

    /// Chunk every document and embed all resulting chunks.
    ///
    /// Every input document gets an entry, in input order, even when it has
    /// no chunks. A failed embedding batch fails the whole call and no
    /// embedding is assigned.
    pub async fn get_document_chunks(
        &self,
        documents: &[Document],
        chunk_token_size: Option<usize>,
    ) -> Result<Vec<ChunkedDocument>> {
        let mut chunked: Vec<ChunkedDocument> = documents
            .iter()
            .map(|doc| self.create_document_chunks(doc, chunk_token_size))
            .collect();

        let texts: Vec<String> = chunked
            .iter()
            .flat_map(|c| c.chunks.iter().map(|chunk| chunk.text.clone()))
            .collect();

        if texts.is_empty() {
            return Ok(chunked);
        }

        let mut embeddings = Vec::with_capacity(texts.len());
        for (batch_index, batch) in texts.chunks(self.batch_size).enumerate() {
            tracing::debug!(batch = batch_index, size = batch.len(), "requesting embeddings");
            let vectors = self.embedder.embed(batch).await?;
            if vectors.len() != batch.len() {
                bail!(
                    "Embedding provider returned {} vectors for {} texts",
                    vectors.len(),
                    batch.len()
                );
            }
            embeddings.extend(vectors);
        }

        let mut vectors = embeddings.into_iter();
        for chunk in chunked.iter_mut().flat_map(|c| c.chunks.iter_mut()) {
            chunk.embedding = vectors.next();
        }

        tracing::debug!(
            documents = chunked.len(),
            chunks = texts.len(),
            "chunked and embedded documents"
        );

        Ok(chunked)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// One token per character; decoding is exact.
    pub struct CharTokenizer;

    impl Tokenizer for CharTokenizer {
        fn encode(&self, text: &str) -> Vec<u32> {
            text.chars().map(|c| c as u32).collect()
        }

        fn decode(&self, tokens: &[u32]) -> String {
            tokens.iter().filter_map(|&t| char::from_u32(t)).collect()
        }
    }

    /// Embeds a text as `[len, position-in-call]` and records batch sizes.
    #[derive(Default)]
    pub struct RecordingEmbedder {
        pub batches: Mutex<Vec<usize>>,
        pub fail: bool,
    }

    #[async_trait]
    impl EmbeddingProvider for RecordingEmbedder {
        fn model_name(&self) -> &str {
            "recording"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            if self.fail {
                bail!("embedding service unavailable");
            }
            self.batches.lock().unwrap().push(texts.len());
            Ok(texts
                .iter()
                .enumerate()
                .map(|(i, t)| vec![t.len() as f32, i as f32])
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{CharTokenizer, RecordingEmbedder};
    use super::*;
    use crate::models::{DocumentMetadata, Source};
    use chrono::Utc;

    fn doc(id: Option<&str>, text: &str) -> Document {
        Document {
            id: id.map(str::to_string),
            text: text.to_string(),
            metadata: DocumentMetadata {
                source: Source::File,
                source_id: format!("{}.md", id.unwrap_or("anon")),
                url: None,
                created_at: Utc::now(),
                author: Some("vault".to_string()),
            },
        }
    }

    fn engine(embedder: Arc<RecordingEmbedder>) -> ChunkingEngine {
        ChunkingEngine::new(Arc::new(CharTokenizer), embedder)
    }

    #[test]
    fn test_whitespace_text_has_no_chunks() {
        assert!(text_chunks(&CharTokenizer, "", 200).is_empty());
        assert!(text_chunks(&CharTokenizer, " \n\t ", 200).is_empty());
    }

    #[test]
    fn test_late_boundary_truncates_window() {
        let text = format!("{}.{}", "a".repeat(400), "b".repeat(199));
        let chunks = text_chunks(&CharTokenizer, &text, 600);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], format!("{}.", "a".repeat(400)));
        assert_eq!(chunks[1], "b".repeat(199));
    }

    #[test]
    fn test_early_boundary_keeps_full_window() {
        let text = format!("{}.{}", "a".repeat(100), "b".repeat(499));
        let chunks = text_chunks(&CharTokenizer, &text, 600);
        assert_eq!(chunks, vec![text]);
    }

    #[test]
    fn test_no_boundary_emits_full_window() {
        let text = format!("{}{}", "x".repeat(600), "y".repeat(100));
        let chunks = text_chunks(&CharTokenizer, &text, 600);
        assert_eq!(chunks, vec!["x".repeat(600), "y".repeat(100)]);
    }

    #[test]
    fn test_short_chunks_are_dropped() {
        assert!(text_chunks(&CharTokenizer, "Hi.", 200).is_empty());
        assert!(text_chunks(&CharTokenizer, "Hello", 200).is_empty());
        assert_eq!(text_chunks(&CharTokenizer, "Hello!", 200), vec!["Hello!"]);
    }

    #[test]
    fn test_only_first_newline_collapses() {
        let chunks = text_chunks(&CharTokenizer, "line one\nline two\nthree", 200);
        assert_eq!(chunks, vec!["line one line two\nthree"]);
    }

    #[test]
    fn test_chunks_cover_every_token_once() {
        let text: String = (0..200)
            .map(|i| format!("Sentence{:04}isHere.", i))
            .collect();
        let chunks = text_chunks(&CharTokenizer, &text, 500);
        assert!(chunks.len() > 1);
        assert_eq!(chunks.concat(), text);
        for c in &chunks {
            assert!(c.chars().count() <= 500);
            assert!(c.chars().count() > MIN_CHUNK_LENGTH_TO_EMBED);
        }
    }

    #[test]
    fn test_cap_emits_remainder_as_final_chunk() {
        let text = "abcdefghij".repeat(10);
        let chunks = split_text(&CharTokenizer, &text, 10, 3);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[3].len(), 70);
        assert_eq!(chunks.concat(), text);
    }

    #[tokio::test]
    async fn test_chunk_ids_and_metadata() {
        let engine = engine(Arc::new(RecordingEmbedder::default()));
        let text = format!("{}{}", "x".repeat(200), "y".repeat(50));
        let result = engine
            .get_document_chunks(&[doc(Some("note1"), &text)], None)
            .await
            .unwrap();

        assert_eq!(result.len(), 1);
        let chunks = &result[0].chunks;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].id, "note1_0");
        assert_eq!(chunks[1].id, "note1_1");
        assert_eq!(chunks[1].metadata.document_id, "note1");
        assert_eq!(chunks[1].metadata.base.source_id, "note1.md");
        assert!(chunks.iter().all(|c| c.embedding.is_some()));
    }

    #[tokio::test]
    async fn test_embeddings_align_across_batches() {
        let embedder = Arc::new(RecordingEmbedder::default());
        let engine = engine(embedder.clone());
        let docs: Vec<Document> = (0..300)
            .map(|i| doc(Some(format!("d{}", i).as_str()), &"z".repeat(10 + i % 150)))
            .collect();

        let result = engine.get_document_chunks(&docs, None).await.unwrap();

        assert_eq!(*embedder.batches.lock().unwrap(), vec![128, 128, 44]);
        for (i, entry) in result.iter().enumerate() {
            assert_eq!(entry.document_id, format!("d{}", i));
            let embedding = entry.chunks[0].embedding.as_ref().unwrap();
            assert_eq!(entry.chunks.len(), 1);
            assert_eq!(embedding[0] as usize, 10 + i % 150);
            assert_eq!(embedding[1] as usize, i % 128);
        }
    }

    #[tokio::test]
    async fn test_empty_documents_keep_their_entry() {
        let embedder = Arc::new(RecordingEmbedder::default());
        let engine = engine(embedder.clone());
        let result = engine
            .get_document_chunks(&[doc(Some("blank"), "   "), doc(None, "")], None)
            .await
            .unwrap();

        assert_eq!(result.len(), 2);
        assert_eq!(result[0].document_id, "blank");
        assert!(result[0].chunks.is_empty());
        assert!(!result[1].document_id.is_empty());
        assert!(embedder.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_batch_is_surfaced() {
        let embedder = Arc::new(RecordingEmbedder {
            fail: true,
            ..Default::default()
        });
        let engine = engine(embedder);
        let err = engine
            .get_document_chunks(&[doc(Some("a"), "Some embeddable text.")], None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unavailable"));
    }
}
