/// Plain-text fields for creating a viewer account; the password is hashed
/// by [`crate::admin::AdminService`] before it ever reaches storage.
#[derive(Debug, Clone)]
pub struct NewViewerAccount {
    pub username: String,
    pub password: String,
    pub allowed_chat_ids: Option<Vec<i64>>,
}

/// Fields a master may change on an existing viewer account. `None` means
/// "leave unchanged"; `allowed_chat_ids: Some(None)` clears the restriction
/// entirely, which is why it is doubly-optional rather than a plain `Vec`.
#[derive(Debug, Clone, Default)]
pub struct ViewerAccountUpdate {
    pub new_password: Option<String>,
    pub allowed_chat_ids: Option<Option<Vec<i64>>>,
    pub is_active: Option<bool>,
}
