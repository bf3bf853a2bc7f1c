//! Cookie session affinity
//!
//! While the canary takes traffic, responses from the canary backend set a
//! cookie and a sticky rule sends requests carrying it back to the canary.
//! Once the split returns to the primary the sticky rule expires the cookie
//! instead. Routers keep no state: the cookie in use is read back from the
//! live route object on every update.

use uuid::Uuid;

pub const COOKIE_HEADER: &str = "Cookie";
pub const SET_COOKIE_HEADER: &str = "Set-Cookie";
const MAX_AGE_ATTR: &str = "Max-Age";

/// What the sticky rule does for the next split
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sticky {
    /// Canary responses set the cookie, requests carrying it go to the canary
    Pin(String),
    /// Requests carrying an old cookie get it expired
    Expire(String),
    /// No cookie was ever handed out
    Idle,
}

impl Sticky {
    /// Picks the sticky behaviour from the cookies found on the live route
    ///
    /// `active` is the cookie canary responses currently set, `expiring` the
    /// one the sticky rule is already expiring.
    pub fn next(
        cookie_name: &str,
        canary_weight: u32,
        active: Option<String>,
        expiring: Option<String>,
    ) -> Self {
        let active = active.filter(|c| cookie_named(c, cookie_name));
        if canary_weight > 0 {
            return Sticky::Pin(active.unwrap_or_else(|| new_cookie(cookie_name)));
        }
        match active.or(expiring) {
            Some(cookie) => Sticky::Expire(cookie),
            None => Sticky::Idle,
        }
    }
}

fn cookie_named(cookie: &str, name: &str) -> bool {
    cookie
        .split_once('=')
        .is_some_and(|(key, value)| key == name && !value.is_empty())
}

/// `name=value` with a random value
pub fn new_cookie(name: &str) -> String {
    format!("{}={}", name, Uuid::new_v4().simple())
}

/// Regex matching a `Cookie` header that carries `cookie`
pub fn cookie_regex(cookie: &str) -> String {
    let (name, value) = cookie.split_once('=').unwrap_or((cookie, ""));
    format!(".*{}.*{}.*", name, value)
}

/// `Set-Cookie` value handing out `cookie`
pub fn set_cookie(cookie: &str, max_age: i64) -> String {
    format!("{}; {}={}", cookie, MAX_AGE_ATTR, max_age)
}

/// `Set-Cookie` value expiring `cookie`
pub fn expire_cookie(cookie: &str) -> String {
    set_cookie(cookie, -1)
}

/// Cookie in a `Set-Cookie` value and whether the value expires it
pub fn parse_set_cookie(value: &str) -> Option<(String, bool)> {
    let mut attrs = value.split(';').map(str::trim);
    let cookie = attrs.next().filter(|c| c.contains('='))?;
    let expired = attrs.any(|a| a == format!("{}=-1", MAX_AGE_ATTR));
    Some((cookie.to_string(), expired))
}
