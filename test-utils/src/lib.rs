//! `test-utils` is used for testing in `linkrelay-lib`.
//! This crate does not depend on `linkrelay-lib`, else we would get dependency cycles.
//! Macros are used instead, so that the importer is responsible for providing the dependencies
//! (`wiremock` and `serde_json`).

/// Path on which downstream services accept links
#[doc(hidden)]
pub const FORWARD_PATH: &str = "/tasks/add_via_extension";

/// Create a mock web server, which responds with a predefined status to
/// every request
#[macro_export]
macro_rules! mock_server {
    ($status:expr $(, $func:tt ($($arg:expr),*))*) => {{
        let mock_server = wiremock::MockServer::start().await;
        let response_template = wiremock::ResponseTemplate::new($status);
        let template = response_template$(.$func($($arg),*))*;
        wiremock::Mock::given(wiremock::matchers::any()).respond_with(template).mount(&mock_server).await;
        mock_server
    }};
}

/// Create a mock downstream service that accepts every forwarded link and
/// answers with the given message
#[macro_export]
macro_rules! accepting_downstream {
    ($message:expr) => {{
        let mock_server = wiremock::MockServer::start().await;
        let reply = wiremock::ResponseTemplate::new(200)
            .set_body_json(serde_json::json!({"success": true, "message": $message}));
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path($crate::FORWARD_PATH))
            .respond_with(reply)
            .mount(&mock_server)
            .await;
        mock_server
    }};
}

/// Create a mock downstream service that only accepts links from a
/// logged-in session.
///
/// Without the session cookie the forward path answers `401`. Posting the
/// given password to `/login` sets the cookie and redirects to `/`, any
/// other password gets the login form again.
#[macro_export]
macro_rules! login_protected_downstream {
    ($password:expr) => {{
        let mock_server = wiremock::MockServer::start().await;

        let accepted = wiremock::ResponseTemplate::new(200)
            .set_body_json(serde_json::json!({"success": true, "message": "task added"}));
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path($crate::FORWARD_PATH))
            .and(wiremock::matchers::header("cookie", "session=valid"))
            .respond_with(accepted)
            .with_priority(1)
            .mount(&mock_server)
            .await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path($crate::FORWARD_PATH))
            .respond_with(wiremock::ResponseTemplate::new(401))
            .mount(&mock_server)
            .await;

        let logged_in = wiremock::ResponseTemplate::new(302)
            .insert_header("Location", "/")
            .insert_header("Set-Cookie", "session=valid; Path=/");
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/login"))
            .and(wiremock::matchers::body_string(format!("password={}", $password)))
            .respond_with(logged_in)
            .with_priority(1)
            .mount(&mock_server)
            .await;
        wiremock::Mock::given(wiremock::matchers::any())
            .and(wiremock::matchers::path("/login"))
            .respond_with($crate::login_form!())
            .mount(&mock_server)
            .await;

        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/"))
            .respond_with(
                wiremock::ResponseTemplate::new(200).set_body_string("<html><body>Dashboard</body></html>"),
            )
            .mount(&mock_server)
            .await;

        mock_server
    }};
}

/// A `200 OK` reply carrying an HTML login form
#[macro_export]
macro_rules! login_form {
    () => {
        wiremock::ResponseTemplate::new(200)
            .insert_header("Content-Type", "text/html; charset=utf-8")
            .set_body_string(
                r#"<!DOCTYPE html><html><body><form action="/login" method="post"><input type="password" name="password"></form></body></html>"#,
            )
    };
}
