//! Injecting retrieved memories and document excerpts into a conversation.

use {
    brainproxy_memory::DocumentIndex,
    brainproxy_protocol::ChatTurn,
};

pub const MEMORY_HEADER: &str = "Relevant memories:\n";
pub const DOCUMENTS_HEADER: &str = "Relevant context from documents:\n\n";

/// Insert `turn` immediately before the last turn (or as the only turn).
pub fn insert_before_last(mut turns: Vec<ChatTurn>, turn: ChatTurn) -> Vec<ChatTurn> {
    let at = turns.len().saturating_sub(1);
    turns.insert(at, turn);
    turns
}

/// Add a memory system turn when `block` is non-empty.
pub fn with_memories(turns: Vec<ChatTurn>, block: &str) -> Vec<ChatTurn> {
    if block.is_empty() {
        return turns;
    }
    insert_before_last(turns, ChatTurn::system(format!("{MEMORY_HEADER}{block}")))
}

/// Search `index` with the final turn's text and add the top `k` excerpts as
/// a system turn before it.
///
/// The conversation is returned unchanged when it is empty, the final turn
/// has no text, or nothing matches.
pub async fn with_documents(
    index: &dyn DocumentIndex,
    turns: Vec<ChatTurn>,
    k: usize,
) -> anyhow::Result<Vec<ChatTurn>> {
    let Some(query) = turns
        .last()
        .and_then(ChatTurn::text)
        .filter(|text| !text.trim().is_empty())
        .map(str::to_owned)
    else {
        return Ok(turns);
    };

    let documents = index.search(&query, k).await?;
    if documents.is_empty() {
        return Ok(turns);
    }

    let block = documents
        .iter()
        .map(|d| d.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    Ok(insert_before_last(
        turns,
        ChatTurn::system(format!("{DOCUMENTS_HEADER}{block}")),
    ))
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use {async_trait::async_trait, brainproxy_memory::Document};

    use super::*;

    struct FixedIndex {
        docs: Vec<&'static str>,
        queries: Mutex<Vec<(String, usize)>>,
    }

    impl FixedIndex {
        fn new(docs: Vec<&'static str>) -> Self {
            Self {
                docs,
                queries: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl DocumentIndex for FixedIndex {
        async fn add(&self, _documents: Vec<Document>) -> anyhow::Result<()> {
            Ok(())
        }

        async fn search(&self, query: &str, k: usize) -> anyhow::Result<Vec<Document>> {
            self.queries.lock().unwrap().push((query.to_string(), k));
            Ok(self.docs.iter().take(k).map(|d| Document::new(*d)).collect())
        }
    }

    #[test]
    fn insert_positions() {
        let one = insert_before_last(vec![ChatTurn::user("q")], ChatTurn::system("s"));
        assert_eq!(one, vec![ChatTurn::system("s"), ChatTurn::user("q")]);

        let empty = insert_before_last(Vec::new(), ChatTurn::system("s"));
        assert_eq!(empty, vec![ChatTurn::system("s")]);
    }

    #[test]
    fn empty_memory_block_is_ignored() {
        let turns = vec![ChatTurn::user("hi")];
        assert_eq!(with_memories(turns.clone(), ""), turns);
    }

    #[tokio::test]
    async fn memories_then_documents_precede_last_turn() {
        let index = FixedIndex::new(vec!["Q3 revenue was $5M", "Q2 revenue was $4M"]);
        let turns = vec![
            ChatTurn::system("sys"),
            ChatTurn::user("earlier"),
            ChatTurn::user("What was Q3 revenue?"),
        ];

        let turns = with_memories(turns, "Works at Acme\nLikes charts");
        let turns = with_documents(&index, turns, 4).await.unwrap();

        assert_eq!(turns, vec![
            ChatTurn::system("sys"),
            ChatTurn::user("earlier"),
            ChatTurn::system("Relevant memories:\nWorks at Acme\nLikes charts"),
            ChatTurn::system(
                "Relevant context from documents:\n\nQ3 revenue was $5M\n\nQ2 revenue was $4M"
            ),
            ChatTurn::user("What was Q3 revenue?"),
        ]);
        assert_eq!(*index.queries.lock().unwrap(), vec![(
            "What was Q3 revenue?".to_string(),
            4
        )]);
    }

    #[tokio::test]
    async fn no_hits_leaves_conversation_alone() {
        let index = FixedIndex::new(Vec::new());
        let turns = vec![ChatTurn::user("anything")];
        assert_eq!(with_documents(&index, turns.clone(), 4).await.unwrap(), turns);
    }

    #[tokio::test]
    async fn empty_conversation_skips_search() {
        let index = FixedIndex::new(vec!["doc"]);
        assert!(with_documents(&index, Vec::new(), 4).await.unwrap().is_empty());
        assert!(index.queries.lock().unwrap().is_empty());
    }
}
