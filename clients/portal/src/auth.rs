use serde::{Deserialize, Serialize};
use url::Url;

pub const SESSION_MARKER: &str = "hakoniwa_session";
pub const INSTANCE_MARKER: &str = "hakoniwa_instance_id";
pub const ENTRY_ERROR_PARAM: &str = "error";

/// Client-local markers the portal gateway keys on. Both are path `/`
/// scoped on the server side and cleared together on logout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMarkers {
    pub session_id: Option<String>,
    pub selected_instance_id: Option<String>,
}

impl SessionMarkers {
    pub fn is_empty(&self) -> bool {
        self.session_id.is_none() && self.selected_instance_id.is_none()
    }

    pub fn clear(&mut self) {
        self.session_id = None;
        self.selected_instance_id = None;
    }

    pub fn cookie_header(&self) -> Option<String> {
        let pairs = [
            (SESSION_MARKER, self.session_id.as_deref()),
            (INSTANCE_MARKER, self.selected_instance_id.as_deref()),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|v| format!("{name}={v}")))
        .collect::<Vec<_>>();
        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }

    /// Applies one `Set-Cookie` header value. Returns true when a marker
    /// changed; cookies other than the two markers are ignored.
    pub fn apply_set_cookie(&mut self, raw: &str) -> bool {
        let Some(cookie) = parse_set_cookie(raw) else {
            return false;
        };
        let slot = match cookie.name.as_str() {
            SESSION_MARKER => &mut self.session_id,
            INSTANCE_MARKER => &mut self.selected_instance_id,
            _ => return false,
        };
        let next = if cookie.expired || cookie.value.is_empty() {
            None
        } else {
            Some(cookie.value)
        };
        if *slot == next {
            return false;
        }
        *slot = next;
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SetCookie {
    name: String,
    value: String,
    expired: bool,
}

fn parse_set_cookie(raw: &str) -> Option<SetCookie> {
    let mut parts = raw.split(';');
    let (name, value) = parts.next()?.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    let value = value.trim().trim_matches('"').to_string();

    let mut expired = false;
    for attr in parts {
        let Some((key, val)) = attr.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let val = val.trim();
        if key.eq_ignore_ascii_case("max-age") {
            expired |= val.parse::<i64>().is_ok_and(|secs| secs <= 0);
        } else if key.eq_ignore_ascii_case("expires") {
            expired |= val.contains("1970");
        }
    }

    Some(SetCookie {
        name: name.to_string(),
        value,
        expired,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryError {
    pub code: String,
    pub cleaned_url: String,
}

impl EntryError {
    pub fn message(&self) -> String {
        match self.code.as_str() {
            "login_failed" => "Login failed".to_string(),
            code => format!("Login failed: {code}"),
        }
    }
}

/// Pulls the provider-side `error` parameter out of the entry URL and
/// returns the address with that parameter removed.
pub fn take_entry_error(entry_url: &str) -> Result<Option<EntryError>, url::ParseError> {
    let mut url = Url::parse(entry_url)?;
    let mut code = None;
    let kept = url
        .query_pairs()
        .filter_map(|(key, value)| {
            if key == ENTRY_ERROR_PARAM {
                code.get_or_insert_with(|| value.into_owned());
                None
            } else {
                Some((key.into_owned(), value.into_owned()))
            }
        })
        .collect::<Vec<_>>();

    let Some(code) = code else {
        return Ok(None);
    };

    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }
    Ok(Some(EntryError {
        code,
        cleaned_url: url.to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_header_lists_present_markers() {
        let mut markers = SessionMarkers::default();
        assert_eq!(markers.cookie_header(), None);

        markers.session_id = Some("tok".to_string());
        assert_eq!(
            markers.cookie_header().as_deref(),
            Some("hakoniwa_session=tok")
        );

        markers.selected_instance_id = Some("i-1".to_string());
        assert_eq!(
            markers.cookie_header().as_deref(),
            Some("hakoniwa_session=tok; hakoniwa_instance_id=i-1")
        );
    }

    #[test]
    fn set_cookie_updates_and_clears_markers() {
        let mut markers = SessionMarkers::default();
        assert!(markers.apply_set_cookie("hakoniwa_session=abc; Path=/; HttpOnly"));
        assert_eq!(markers.session_id.as_deref(), Some("abc"));
        assert!(!markers.apply_set_cookie("hakoniwa_session=abc; Path=/"));

        assert!(markers.apply_set_cookie("hakoniwa_instance_id=i-9; Path=/"));
        assert!(markers.apply_set_cookie(
            "hakoniwa_instance_id=; Path=/; Expires=Thu, 01 Jan 1970 00:00:00 GMT"
        ));
        assert!(markers.selected_instance_id.is_none());

        assert!(markers.apply_set_cookie("hakoniwa_session=abc; Path=/; Max-Age=0"));
        assert!(markers.is_empty());
    }

    #[test]
    fn unrelated_cookies_are_ignored() {
        let mut markers = SessionMarkers::default();
        assert!(!markers.apply_set_cookie("theme=dark; Path=/"));
        assert!(!markers.apply_set_cookie("garbage"));
        assert!(markers.is_empty());
    }

    #[test]
    fn entry_error_is_extracted_and_stripped() {
        let entry = take_entry_error("https://portal.example/?error=access_denied&lang=en")
            .expect("parse")
            .expect("error present");
        assert_eq!(entry.code, "access_denied");
        assert_eq!(entry.cleaned_url, "https://portal.example/?lang=en");
        assert_eq!(entry.message(), "Login failed: access_denied");

        let only = take_entry_error("https://portal.example/?error=login_failed")
            .expect("parse")
            .expect("error present");
        assert_eq!(only.cleaned_url, "https://portal.example/");
        assert_eq!(only.message(), "Login failed");
    }

    #[test]
    fn entry_without_error_is_left_alone() {
        assert_eq!(
            take_entry_error("https://portal.example/?lang=en").expect("parse"),
            None
        );
        assert!(take_entry_error("not a url").is_err());
    }
}
