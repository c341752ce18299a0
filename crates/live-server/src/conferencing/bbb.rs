//! BigBlueButton API client.
//!
//! Every API call is a GET against `{base}api/{call}?{query}&checksum=...`
//! where the checksum is `hex(SHA1(call + query + secret))`. Responses are
//! XML documents with a `returncode` of `SUCCESS` or `FAILED`.

use crate::errors::LiveError;
use crate::models::Server;
use common::secret::ExposeSecret;
use reqwest::{Client, Url};
use ring::digest;
use serde::Deserialize;
use std::time::Duration;
use tracing::{error, instrument, warn};

const SERVICE: &str = "bbb";

/// Base cost of any running meeting.
const MEETING_BASE_COST: u64 = 10;

/// Cost weight of each participant for each video stream.
const VIDEO_WEIGHT: u64 = 10;

/// Load reported by BBB for one running meeting.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MeetingTelemetry {
    #[serde(rename = "meetingID")]
    pub meeting_id: String,
    #[serde(rename = "participantCount", default)]
    pub participant_count: u64,
    #[serde(rename = "voiceParticipantCount", default)]
    pub voice_participant_count: u64,
    #[serde(rename = "videoCount", default)]
    pub video_count: u64,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    returncode: String,
    #[serde(rename = "messageKey", default)]
    message_key: Option<String>,
    #[serde(default)]
    meetings: Option<MeetingList>,
}

#[derive(Debug, Default, Deserialize)]
struct MeetingList {
    #[serde(default)]
    meeting: Vec<MeetingTelemetry>,
}

/// Estimated load of a server from its running meetings.
///
/// Each meeting costs `10 + 10·participants·video + participants·voice`.
/// The total saturates at `i64::MAX` instead of overflowing.
#[must_use]
pub fn meetings_cost(meetings: &[MeetingTelemetry]) -> i64 {
    let total = meetings.iter().fold(0u64, |acc, m| {
        let video = VIDEO_WEIGHT
            .saturating_mul(m.participant_count)
            .saturating_mul(m.video_count);
        let voice = m.participant_count.saturating_mul(m.voice_participant_count);
        acc.saturating_add(MEETING_BASE_COST)
            .saturating_add(video)
            .saturating_add(voice)
    });
    i64::try_from(total).unwrap_or(i64::MAX)
}

/// `hex(SHA1(call + query + secret))`.
#[must_use]
pub fn checksum(call: &str, query: &str, secret: &str) -> String {
    let mut ctx = digest::Context::new(&digest::SHA1_FOR_LEGACY_USE_ONLY);
    ctx.update(call.as_bytes());
    ctx.update(query.as_bytes());
    ctx.update(secret.as_bytes());
    hex::encode(ctx.finish())
}

/// Build a signed API URL.
///
/// # Errors
///
/// Returns `LiveError::ExternalService` if `base` is not a valid URL.
pub fn api_url(
    base: &str,
    call: &str,
    params: &[(&str, &str)],
    secret: &str,
) -> Result<Url, LiveError> {
    let base = if base.ends_with('/') {
        base.to_string()
    } else {
        format!("{base}/")
    };
    let mut url = Url::parse(&format!("{base}api/{call}")).map_err(|e| {
        error!(target: "live.conferencing.bbb", error = %e, "Invalid BBB server URL");
        LiveError::ExternalService {
            service: SERVICE,
            detail: format!("invalid server url: {e}"),
        }
    })?;

    url.query_pairs_mut().extend_pairs(params.iter().copied());
    let query = url.query().unwrap_or_default().to_string();
    url.query_pairs_mut()
        .append_pair("checksum", &checksum(call, &query, secret));
    Ok(url)
}

/// Parse a `getMeetings` response.
///
/// # Errors
///
/// Returns `LiveError::ExternalService` on malformed XML or a `FAILED`
/// return code.
pub fn parse_meetings(xml: &str) -> Result<Vec<MeetingTelemetry>, LiveError> {
    let response = parse_response(xml)?;
    Ok(response.meetings.unwrap_or_default().meeting)
}

fn parse_response(xml: &str) -> Result<ApiResponse, LiveError> {
    let response: ApiResponse =
        quick_xml::de::from_str(xml).map_err(|e| LiveError::ExternalService {
            service: SERVICE,
            detail: format!("malformed response: {e}"),
        })?;
    if response.returncode != "SUCCESS" {
        return Err(LiveError::ExternalService {
            service: SERVICE,
            detail: format!(
                "returncode {} ({})",
                response.returncode,
                response.message_key.as_deref().unwrap_or("no message key")
            ),
        });
    }
    Ok(response)
}

/// Parameters of a `create` call.
#[derive(Debug, Clone)]
pub struct CreateMeeting<'a> {
    pub meeting_id: &'a str,
    pub name: &'a str,
    pub attendee_pw: &'a str,
    pub moderator_pw: &'a str,
}

/// HTTP client for BBB servers.
#[derive(Clone)]
pub struct BbbClient {
    client: Client,
}

impl BbbClient {
    /// Create a client with a bounded request timeout.
    ///
    /// # Errors
    ///
    /// Returns `LiveError::Internal` if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self, LiveError> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            error!(target: "live.conferencing.bbb", error = %e, "Failed to build HTTP client");
            LiveError::Internal(format!("http client: {e}"))
        })?;
        Ok(Self { client })
    }

    /// Running meetings on `server`.
    ///
    /// # Errors
    ///
    /// Returns `LiveError::ExternalService` if the server is unreachable or
    /// answers with an error.
    #[instrument(skip_all, fields(server_id = %server.id))]
    pub async fn get_meetings(&self, server: &Server) -> Result<Vec<MeetingTelemetry>, LiveError> {
        let url = api_url(
            &server.url,
            "getMeetings",
            &[],
            server.secret.expose_secret(),
        )?;
        let body = self.fetch(url).await?;
        parse_meetings(&body)
    }

    /// Create a meeting. BBB treats re-creating a running meeting as success.
    ///
    /// # Errors
    ///
    /// Returns `LiveError::ExternalService` if the server is unreachable or
    /// rejects the meeting.
    #[instrument(skip_all, fields(server_id = %server.id, meeting_id = %meeting.meeting_id))]
    pub async fn create_meeting(
        &self,
        server: &Server,
        meeting: &CreateMeeting<'_>,
    ) -> Result<(), LiveError> {
        let url = api_url(
            &server.url,
            "create",
            &[
                ("name", meeting.name),
                ("meetingID", meeting.meeting_id),
                ("attendeePW", meeting.attendee_pw),
                ("moderatorPW", meeting.moderator_pw),
            ],
            server.secret.expose_secret(),
        )?;
        let body = self.fetch(url).await?;
        parse_response(&body).map(|_| ())
    }

    async fn fetch(&self, url: Url) -> Result<String, LiveError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            warn!(target: "live.conferencing.bbb", error = %e, "BBB request failed");
            LiveError::ExternalService {
                service: SERVICE,
                detail: e.to_string(),
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            warn!(target: "live.conferencing.bbb", status = %status, "BBB returned error status");
            return Err(LiveError::ExternalService {
                service: SERVICE,
                detail: format!("status {status}"),
            });
        }

        response.text().await.map_err(|e| {
            warn!(target: "live.conferencing.bbb", error = %e, "Failed to read BBB response");
            LiveError::ExternalService {
                service: SERVICE,
                detail: e.to_string(),
            }
        })
    }
}

/// Signed `join` URL for a user. Needs no round trip.
///
/// # Errors
///
/// Returns `LiveError::ExternalService` if the server URL is invalid.
pub fn join_url(
    server: &Server,
    meeting_id: &str,
    full_name: &str,
    user_id: &str,
    password: &str,
) -> Result<Url, LiveError> {
    api_url(
        &server.url,
        "join",
        &[
            ("meetingID", meeting_id),
            ("fullName", full_name),
            ("userID", user_id),
            ("password", password),
            ("redirect", "true"),
        ],
        server.secret.expose_secret(),
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::ServerKind;
    use common::secret::SecretString;
    use uuid::Uuid;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SECRET: &str = "639259d4-9dd8-4b25-bf01-95f9567eaf4b";

    fn server(url: &str) -> Server {
        Server {
            id: Uuid::new_v4(),
            kind: ServerKind::Bbb,
            url: url.to_string(),
            secret: SecretString::from(SECRET),
            active: true,
            world_exclusive: None,
            cost: 0,
            rooms_only: false,
        }
    }

    fn meetings_xml(meetings: &[(&str, i128, i128, i128)]) -> String {
        let body: String = meetings
            .iter()
            .map(|(id, participants, voice, video)| {
                format!(
                    "<meeting><meetingName>m</meetingName><meetingID>{id}</meetingID>\
                     <participantCount>{participants}</participantCount>\
                     <listenerCount>0</listenerCount>\
                     <voiceParticipantCount>{voice}</voiceParticipantCount>\
                     <videoCount>{video}</videoCount></meeting>"
                )
            })
            .collect();
        format!("<response><returncode>SUCCESS</returncode><meetings>{body}</meetings></response>")
    }

    #[test]
    fn test_cost_formula() {
        let meetings = parse_meetings(&meetings_xml(&[("abc", 3, 2, 1)])).unwrap();
        assert_eq!(meetings_cost(&meetings), 46);
    }

    #[test]
    fn test_cost_sums_meetings() {
        let meetings = parse_meetings(&meetings_xml(&[("a", 3, 2, 1), ("b", 0, 0, 0)])).unwrap();
        assert_eq!(meetings.len(), 2);
        assert_eq!(meetings_cost(&meetings), 56);
        assert_eq!(meetings_cost(&[]), 0);
    }

    #[test]
    fn test_parse_no_meetings() {
        let xml = "<response><returncode>SUCCESS</returncode><meetings/>\
                   <messageKey>noMeetings</messageKey></response>";
        assert!(parse_meetings(xml).unwrap().is_empty());
    }

    #[test]
    fn test_parse_failed_returncode() {
        let xml = "<response><returncode>FAILED</returncode>\
                   <messageKey>checksumError</messageKey></response>";
        let err = parse_meetings(xml).unwrap_err();
        assert_eq!(err.code(), "bbb.failed");
        assert!(err.to_string().contains("checksumError"));
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse_meetings("not xml at all").is_err());
    }

    #[test]
    fn test_negative_counts_rejected() {
        let err = parse_meetings(&meetings_xml(&[("neg", -1000, 2, 1)])).unwrap_err();
        assert_eq!(err.code(), "bbb.failed");

        let err = parse_meetings(&meetings_xml(&[("neg", 3, 2, -5)])).unwrap_err();
        assert_eq!(err.code(), "bbb.failed");
    }

    #[test]
    fn test_oversized_counts_saturate() {
        let max = i128::from(u64::MAX);
        let meetings =
            parse_meetings(&meetings_xml(&[("big", max, max, max), ("small", 3, 2, 1)])).unwrap();
        assert_eq!(meetings_cost(&meetings), i64::MAX);

        let meetings = parse_meetings(&meetings_xml(&[("wide", 1 << 40, 1 << 40, 0)])).unwrap();
        assert_eq!(meetings_cost(&meetings), i64::MAX);
    }

    #[test]
    fn test_checksum_known_values() {
        assert_eq!(
            checksum("getMeetings", "", SECRET),
            "2027baa7771026e9e93392f55031535d1444c41f"
        );
        assert_eq!(
            checksum(
                "create",
                "name=Test+Meeting&meetingID=abc123&attendeePW=111222&moderatorPW=333444",
                SECRET
            ),
            "1fcbb0c4fc1f039f73aa6d697d2db9ba7f803f17"
        );
    }

    #[test]
    fn test_api_url_signs_encoded_query() {
        let url = api_url(
            "https://bbb.example.org/bigbluebutton",
            "create",
            &[
                ("name", "Test Meeting"),
                ("meetingID", "abc123"),
                ("attendeePW", "111222"),
                ("moderatorPW", "333444"),
            ],
            SECRET,
        )
        .unwrap();
        assert_eq!(url.path(), "/bigbluebutton/api/create");
        assert_eq!(
            url.query().unwrap(),
            "name=Test+Meeting&meetingID=abc123&attendeePW=111222&moderatorPW=333444\
             &checksum=1fcbb0c4fc1f039f73aa6d697d2db9ba7f803f17"
        );
    }

    #[test]
    fn test_join_url_does_not_leak_secret() {
        let url = join_url(
            &server("https://bbb.example.org/bigbluebutton/"),
            "m1",
            "Alice",
            "u1",
            "pw",
        )
        .unwrap();
        assert!(url.as_str().contains("api/join?"));
        assert!(url.as_str().contains("checksum="));
        assert!(!url.as_str().contains(SECRET));
    }

    #[tokio::test]
    async fn test_get_meetings_over_http() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bigbluebutton/api/getMeetings"))
            .and(query_param(
                "checksum",
                "2027baa7771026e9e93392f55031535d1444c41f",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_string(meetings_xml(&[(
                "abc", 3, 2, 1,
            )])))
            .expect(1)
            .mount(&mock)
            .await;

        let client = BbbClient::new(Duration::from_secs(5)).unwrap();
        let meetings = client
            .get_meetings(&server(&format!("{}/bigbluebutton/", mock.uri())))
            .await
            .unwrap();
        assert_eq!(meetings_cost(&meetings), 46);
    }

    #[tokio::test]
    async fn test_get_meetings_server_error() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock)
            .await;

        let client = BbbClient::new(Duration::from_secs(5)).unwrap();
        let err = client
            .get_meetings(&server(&format!("{}/bigbluebutton/", mock.uri())))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "bbb.failed");
    }

    #[tokio::test]
    async fn test_create_meeting() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bigbluebutton/api/create"))
            .and(query_param("meetingID", "m-1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<response><returncode>SUCCESS</returncode><meetingID>m-1</meetingID></response>",
            ))
            .expect(1)
            .mount(&mock)
            .await;

        let client = BbbClient::new(Duration::from_secs(5)).unwrap();
        client
            .create_meeting(
                &server(&format!("{}/bigbluebutton/", mock.uri())),
                &CreateMeeting {
                    meeting_id: "m-1",
                    name: "Stage",
                    attendee_pw: "a",
                    moderator_pw: "m",
                },
            )
            .await
            .unwrap();
    }
}
