//! The standard collection catalogue.

use tandem_engine::{ChildSpec, CollectionDescriptor, FieldDef, FieldType, IdentityRule, Schema};

pub const NOTES: &str = "notes";
pub const FLASHCARD_DECKS: &str = "flashcard-decks";
pub const QUIZZES: &str = "quizzes";
pub const CHAT_TRANSCRIPTS: &str = "chat-transcripts";

/// Characters compared by the duplicate-content heuristic.
const IDENTITY_PREFIX: usize = 50;

pub fn notes() -> CollectionDescriptor {
    CollectionDescriptor::new(
        NOTES,
        vec![
            FieldDef::required("title", FieldType::String),
            FieldDef::optional("content", FieldType::String),
            FieldDef::optional("tags", FieldType::Json),
        ],
    )
    .with_identity(IdentityRule::prefix(&["title", "content"], IDENTITY_PREFIX))
}

pub fn flashcard_decks() -> CollectionDescriptor {
    CollectionDescriptor::new(
        FLASHCARD_DECKS,
        vec![
            FieldDef::required("title", FieldType::String),
            FieldDef::optional("description", FieldType::String),
        ],
    )
    .with_children(ChildSpec::new(
        "cards",
        "flashcards",
        "deck_id",
        vec![
            FieldDef::required("front", FieldType::String),
            FieldDef::required("back", FieldType::String),
            FieldDef::optional("lastReviewed", FieldType::Timestamp),
        ],
    ))
    .with_identity(IdentityRule::prefix(&["title"], IDENTITY_PREFIX))
}

pub fn quizzes() -> CollectionDescriptor {
    CollectionDescriptor::new(
        QUIZZES,
        vec![
            FieldDef::required("title", FieldType::String),
            FieldDef::optional("topic", FieldType::String),
            FieldDef::optional("bestScore", FieldType::Float),
        ],
    )
    .with_children(ChildSpec::new(
        "questions",
        "quiz_questions",
        "quiz_id",
        vec![
            FieldDef::required("prompt", FieldType::String),
            FieldDef::required("choices", FieldType::Json),
            FieldDef::required("answerIndex", FieldType::Int),
            FieldDef::optional("explanation", FieldType::String),
        ],
    ))
    .with_identity(IdentityRule::prefix(&["title"], IDENTITY_PREFIX))
}

pub fn chat_transcripts() -> CollectionDescriptor {
    CollectionDescriptor::new(
        CHAT_TRANSCRIPTS,
        vec![
            FieldDef::required("title", FieldType::String),
            FieldDef::optional("model", FieldType::String),
        ],
    )
    .with_children(ChildSpec::new(
        "messages",
        "chat_messages",
        "transcript_id",
        vec![
            FieldDef::required("role", FieldType::String),
            FieldDef::required("content", FieldType::String),
            FieldDef::optional("sentAt", FieldType::Timestamp),
        ],
    ))
    .with_identity(IdentityRule::prefix(&["title"], IDENTITY_PREFIX))
}

/// All four standard collections.
pub fn standard_schema() -> Schema {
    Schema::new()
        .with_collection(notes())
        .with_collection(flashcard_decks())
        .with_collection(quizzes())
        .with_collection(chat_transcripts())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalogue_tables() {
        let schema = standard_schema();
        let names: Vec<&str> = schema.names().map(String::as_str).collect();
        assert_eq!(
            names,
            vec![CHAT_TRANSCRIPTS, FLASHCARD_DECKS, NOTES, QUIZZES]
        );

        assert_eq!(schema.require(FLASHCARD_DECKS).unwrap().table, "flashcard_decks");
        assert_eq!(schema.require(CHAT_TRANSCRIPTS).unwrap().table, "chat_transcripts");
        assert!(schema.require(NOTES).unwrap().children.is_none());
        assert_eq!(
            schema.require(QUIZZES).unwrap().children.as_ref().unwrap().field,
            "questions"
        );
    }
}
