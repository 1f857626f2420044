//! Detection of login pages served in place of an API answer.
//!
//! Some deployments answer an unauthenticated API call with their HTML
//! login form and a `200 OK` instead of a `401`. Such replies have to be
//! treated like a `401`.

/// At least one of these must appear for a body to count as an HTML page
const HTML_MARKERS: &[&str] = &["<html", "<!doctype html"];

/// At least one of these must appear for an HTML page to count as a login page
const LOGIN_MARKERS: &[&str] = &[
    "login",
    "登录",
    r#"name="password""#,
    "name='password'",
    r#"type="password""#,
    "type='password'",
    r#"action="/login""#,
    "action='/login'",
];

/// Check whether a successful reply is really a login page.
///
/// JSON replies never are. Everything else is matched case-insensitively
/// against [`HTML_MARKERS`] and [`LOGIN_MARKERS`].
pub(crate) fn looks_like_login_page(content_type: Option<&str>, body: &str) -> bool {
    if content_type.is_some_and(|value| value.to_ascii_lowercase().contains("json")) {
        return false;
    }

    let body = body.to_lowercase();
    HTML_MARKERS.iter().any(|marker| body.contains(marker))
        && LOGIN_MARKERS.iter().any(|marker| body.contains(marker))
}
