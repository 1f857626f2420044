use http::header;
use log::debug;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::{Method, StatusCode};

use crate::client::{HttpPool, Outbound, Payload, Reply, TlsMode};
use crate::{ErrorKind, Result};

/// The requests of one submission.
///
/// A session keeps the cookies its replies set and follows redirects by
/// hand, so the login of one submission never leaks into another and the
/// cookies of every redirect hop are kept.
#[derive(Debug)]
pub(crate) struct Session<'a> {
    pool: &'a HttpPool,
    jar: Jar,
    max_redirects: usize,
    tls: TlsMode,
}

impl<'a> Session<'a> {
    pub(crate) fn new(pool: &'a HttpPool, max_redirects: usize) -> Self {
        Self {
            pool,
            jar: Jar::default(),
            max_redirects,
            tls: TlsMode::Verify,
        }
    }

    /// Use the given certificate validation for all requests of this session
    pub(crate) fn with_tls(mut self, tls: TlsMode) -> Self {
        self.tls = tls;
        self
    }

    /// Send `request`, following up to `max_redirects` redirects.
    ///
    /// `301`, `302` and `303` continue with a `GET` without body, `307` and
    /// `308` repeat method and body. A `307` or `308` to another origin is
    /// not followed, so a body is never sent anywhere else. The returned
    /// reply is the last hop.
    pub(crate) async fn send(&self, mut request: Outbound) -> Result<Reply> {
        let origin = request.url.clone();
        let mut hops = 0;

        loop {
            request.cookie = self.jar.cookies(&request.url);
            let reply = self.pool.fetch(request.clone(), self.tls).await?;
            self.jar
                .set_cookies(&mut reply.headers.get_all(header::SET_COOKIE).iter(), &reply.url);

            let rewrite = match reply.status {
                StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND | StatusCode::SEE_OTHER => true,
                StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT => false,
                _ => return Ok(reply),
            };
            let Some(location) = reply.headers.get(header::LOCATION) else {
                return Ok(reply);
            };

            if hops >= self.max_redirects {
                return Err(ErrorKind::TooManyRedirects(origin, hops));
            }
            hops += 1;

            let invalid = || ErrorKind::InvalidRedirect {
                url: reply.url.clone(),
                location: String::from_utf8_lossy(location.as_bytes()).into_owned(),
            };
            let location = location.to_str().map_err(|_| invalid())?;
            let next = reply.url.join(location).map_err(|_| invalid())?;
            debug!("Following redirect {} -> {next}", reply.url);

            if rewrite {
                request.method = Method::GET;
                request.payload = Payload::Empty;
            } else if next.origin() != reply.url.origin() {
                debug!("Not repeating {} to another origin: {next}", request.method);
                return Ok(reply);
            }
            request.url = next;
        }
    }
}
