//! Email address checks shared by ingestion and single-recipient adds.
use validator::ValidateEmail;

/// Syntax check through `validator`: dot-atom local part, hostname (IDN
/// allowed) or bracketed IP literal. The local part must be ASCII; case
/// folding in the underlying pattern would otherwise let look-alike code
/// points such as U+212A through.
pub fn is_valid_email(value: &str) -> bool {
    let Some((user, _)) = value.rsplit_once('@') else {
        return false;
    };
    user.is_ascii() && value.to_string().validate_email()
}

/// Key used for duplicate detection. Matches the store's `COLLATE NOCASE`,
/// which folds ASCII letters only.
pub fn dedupe_key(value: &str) -> String {
    value.to_ascii_lowercase()
}
