//! Subscription feed endpoint.

use axum::{
    extract::{Path, State},
    http::{
        HeaderMap, HeaderName, HeaderValue,
        header::{CONTENT_DISPOSITION, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::Utc;

use crate::{error::AppError, services::subscription_service::SubscriptionFeed, state::AppState};

const PROFILE_TITLE: HeaderName = HeaderName::from_static("profile-title");
const PROFILE_UPDATE_INTERVAL: HeaderName = HeaderName::from_static("profile-update-interval");
const SUBSCRIPTION_USERINFO: HeaderName = HeaderName::from_static("subscription-userinfo");

/// `GET /sub/{token}`
///
/// # Response (200 OK)
///
/// Body: base64 of the newline-joined connection descriptors. Headers:
///
/// - `Content-Disposition: attachment; filename="{name}.txt"`
/// - `Profile-Title`: the feed name (`base64:`-prefixed when not ASCII)
/// - `Profile-Update-Interval`: polling hint in hours
/// - `Subscription-Userinfo: upload=..; download=..; total=..; expire=..`
///
/// # Errors
///
/// - 404 `subscription_not_found`: no user holds the token
pub async fn subscription_feed(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Response, AppError> {
    let feed = state
        .subscriptions
        .build_feed(&token, Utc::now())
        .await?
        .ok_or(AppError::SubscriptionNotFound)?;

    Ok((feed_headers(&feed), feed.encoded_body()).into_response())
}

fn feed_headers(feed: &SubscriptionFeed) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));

    let file_name: String = feed
        .title
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect();
    let file_name = if file_name.is_empty() {
        "subscription".to_string()
    } else {
        file_name
    };

    let title = if feed.title.is_ascii() && !feed.title.chars().any(char::is_control) {
        feed.title.clone()
    } else {
        format!("base64:{}", STANDARD.encode(&feed.title))
    };

    let values = [
        (CONTENT_DISPOSITION, format!("attachment; filename=\"{file_name}.txt\"")),
        (PROFILE_TITLE, title),
        (PROFILE_UPDATE_INTERVAL, feed.update_interval_hours.to_string()),
        (SUBSCRIPTION_USERINFO, feed.userinfo_header()),
    ];
    for (name, value) in values {
        match HeaderValue::from_str(&value) {
            Ok(value) => {
                headers.insert(name, value);
            }
            Err(e) => tracing::warn!(header = %name, error = %e, "Skipping invalid feed header"),
        }
    }

    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::subscription_service::UsageSummary;

    fn feed(title: &str) -> SubscriptionFeed {
        SubscriptionFeed {
            title: title.to_string(),
            update_interval_hours: 6,
            descriptors: vec![],
            usage: UsageSummary::default(),
        }
    }

    #[test]
    fn ascii_titles_are_sent_verbatim() {
        let headers = feed_headers(&feed("My VPN"));
        assert_eq!(headers[PROFILE_TITLE], "My VPN");
        assert_eq!(headers[CONTENT_DISPOSITION], "attachment; filename=\"MyVPN.txt\"");
        assert_eq!(headers[PROFILE_UPDATE_INTERVAL], "6");
        assert_eq!(
            headers[SUBSCRIPTION_USERINFO],
            "upload=0; download=0; total=0; expire=0"
        );
    }

    #[test]
    fn non_ascii_titles_are_base64_prefixed() {
        let headers = feed_headers(&feed("Подписка"));
        let expected = format!("base64:{}", STANDARD.encode("Подписка"));
        assert_eq!(headers[PROFILE_TITLE], expected.as_str());
        assert_eq!(
            headers[CONTENT_DISPOSITION],
            "attachment; filename=\"subscription.txt\""
        );
    }
}
