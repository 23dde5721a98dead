use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display};

/// Opaque position in a change feed.
///
/// Stored exactly as the store hands it out and passed back verbatim when
/// resuming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(pub Value);

impl ResumeToken {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChangeOperation {
    Insert,
    Update,
    Replace,
    Delete,
    /// The feed can no longer continue (collection dropped or renamed)
    Invalidate,
}

impl ChangeOperation {
    /// Operations that can carry a full document.
    pub fn carries_document(&self) -> bool {
        matches!(
            self,
            ChangeOperation::Insert | ChangeOperation::Update | ChangeOperation::Replace
        )
    }
}

/// One mutation delivered by a change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub collection: String,
    pub operation_type: ChangeOperation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_key: Option<Value>,
    /// Post-image for insert, update and replace
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_document: Option<Value>,
    pub resume_token: ResumeToken,
}

impl ChangeEvent {
    pub fn new(
        collection: impl Into<String>,
        operation_type: ChangeOperation,
        resume_token: ResumeToken,
    ) -> Self {
        Self {
            collection: collection.into(),
            operation_type,
            document_key: None,
            full_document: None,
            resume_token,
        }
    }

    pub fn with_document_key(mut self, key: Value) -> Self {
        self.document_key = Some(key);
        self
    }

    /// Attach the post-image. Ignored for delete and invalidate.
    pub fn with_full_document(mut self, document: Value) -> Self {
        if self.operation_type.carries_document() {
            self.full_document = Some(document);
        }
        self
    }

    /// Name under which the event is published: `<collection>_change`.
    pub fn event_name(&self) -> String {
        format!("{}_change", self.collection)
    }
}
