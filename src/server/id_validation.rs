use crate::error::TailcastError;

/// Longest resource id accepted.
pub const MAX_ID_LEN: usize = 128;

/// Validate a resource id taken from the request path.
///
/// Ids become part of store keys and of the source URL, so only
/// `[A-Za-z0-9_-]{1,128}` is accepted. That rules out path separators,
/// `..`, whitespace and the `:` used as key delimiter.
///
/// # Errors
/// Returns [`TailcastError::InvalidResourceId`] for empty, overlong or
/// non-conforming ids.
pub fn validate_resource_id(id: &str) -> Result<(), TailcastError> {
    if id.is_empty() {
        return Err(TailcastError::InvalidResourceId(
            "id must not be empty".to_string(),
        ));
    }
    if id.len() > MAX_ID_LEN {
        return Err(TailcastError::InvalidResourceId(format!(
            "id longer than {MAX_ID_LEN} characters"
        )));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(TailcastError::InvalidResourceId(format!(
            "character {bad:?} not allowed in {id:?}"
        )));
    }
    Ok(())
}
