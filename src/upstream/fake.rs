//! In-process stand-in for the upstream catalog API used by tests

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};
use url::Url;

use super::client::{UpstreamClient, UpstreamOptions};
use crate::budget::CallBudget;
use crate::clock::SystemClock;
use crate::http::{HttpClient, HttpResponse};

const BASE_URL: &str = "https://api.example.com/podcast/v1/podcast";
const AUTH_URL: &str = "https://api.example.com/auth/login";

#[derive(Debug, Clone)]
struct FakeEpisode {
    id: String,
    number: usize,
    title: String,
    content: Option<String>,
}

#[derive(Debug, Default)]
struct FakePodcast {
    title: String,
    episodes: Vec<FakeEpisode>,
    announced_total: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct Recorded {
    pub segments: Vec<String>,
    pub query: HashMap<String, String>,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Default)]
struct FakeState {
    podcasts: BTreeMap<String, FakePodcast>,
    requests: Vec<Recorded>,
    logins: usize,
    reject_logins: bool,
    login_expires_in: Option<u64>,
    fail_with: Option<u16>,
    fail_next: Vec<u16>,
    malformed: bool,
    empty_pages: HashSet<usize>,
    hidden_from_batch: HashSet<String>,
}

/// Shared handle; clones observe the same state
#[derive(Debug, Clone, Default)]
pub struct FakeApi {
    state: Arc<Mutex<FakeState>>,
}

/// Client wired to `api` with a budget that never gets in the way
pub fn fake_client(api: FakeApi) -> UpstreamClient<FakeApi> {
    let options = api.options();
    UpstreamClient::new(
        api,
        options,
        Arc::new(CallBudget::new(Duration::ZERO, 1000, SystemClock::shared())),
        SystemClock::shared(),
    )
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn options(&self) -> UpstreamOptions {
        let mut options = UpstreamOptions::new(
            Url::parse(BASE_URL).unwrap(),
            Url::parse(AUTH_URL).unwrap(),
        );
        options.api_key = "test-key".to_string();
        options.username = "user".to_string();
        options.password = "secret".to_string();
        options
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn add_podcast(&self, id: &str, title: &str) {
        self.lock().podcasts.insert(
            id.to_string(),
            FakePodcast {
                title: title.to_string(),
                ..Default::default()
            },
        );
    }

    /// Append `count` episodes, each newer than the ones before
    pub fn add_episodes(&self, podcast_id: &str, count: usize) {
        let mut state = self.lock();
        let podcast = state.podcasts.entry(podcast_id.to_string()).or_default();
        let start = podcast.episodes.len() + 1;
        for number in start..start + count {
            let id = format!("{podcast_id}-{number}");
            podcast.episodes.push(FakeEpisode {
                content: Some(format!("<p>Full text of {id}</p>")),
                title: format!("Episode {number}"),
                id,
                number,
            });
        }
    }

    pub fn rename_episode(&self, episode_id: &str, title: &str) {
        let mut state = self.lock();
        for podcast in state.podcasts.values_mut() {
            for episode in &mut podcast.episodes {
                if episode.id == episode_id {
                    episode.title = title.to_string();
                }
            }
        }
    }

    pub fn announce_total(&self, podcast_id: &str, total: usize) {
        if let Some(podcast) = self.lock().podcasts.get_mut(podcast_id) {
            podcast.announced_total = Some(total);
        }
    }

    pub fn empty_page(&self, page: usize) {
        self.lock().empty_pages.insert(page);
    }

    /// Leave `episode_id` out of batch lookups
    pub fn hide_from_batch(&self, episode_id: &str) {
        self.lock().hidden_from_batch.insert(episode_id.to_string());
    }

    /// Answer every GET with `status`, or restore normal service with `None`
    pub fn fail_with(&self, status: Option<u16>) {
        self.lock().fail_with = status;
    }

    /// Answer the next `count` GETs with `status`
    pub fn fail_next(&self, count: usize, status: u16) {
        self.lock().fail_next.extend(std::iter::repeat_n(status, count));
    }

    pub fn serve_malformed(&self, malformed: bool) {
        self.lock().malformed = malformed;
    }

    pub fn reject_logins(&self, reject: bool) {
        self.lock().reject_logins = reject;
    }

    /// Lifetime announced with every issued token
    pub fn login_expires_in(&self, secs: Option<u64>) {
        self.lock().login_expires_in = secs;
    }

    pub fn logins(&self) -> usize {
        self.lock().logins
    }

    pub fn get_count(&self) -> usize {
        self.lock().requests.len()
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.lock().requests.clone()
    }

    pub fn last_headers(&self) -> Vec<(String, String)> {
        self.lock()
            .requests
            .last()
            .map(|r| r.headers.clone())
            .unwrap_or_default()
    }

    /// Number of GETs whose first path segment is `first`
    pub fn calls_to(&self, first: &str) -> usize {
        self.lock()
            .requests
            .iter()
            .filter(|r| r.segments.first().map(String::as_str) == Some(first))
            .count()
    }

    fn episode_list_requests(&self) -> Vec<Recorded> {
        let state = self.lock();
        state
            .requests
            .iter()
            .filter(|r| r.segments.len() == 1 && state.podcasts.contains_key(&r.segments[0]))
            .cloned()
            .collect()
    }

    pub fn episode_list_hits(&self) -> Vec<usize> {
        self.episode_list_requests()
            .iter()
            .map(|r| query_number(&r.query, "hits", 0))
            .collect()
    }

    pub fn episode_list_pages(&self) -> Vec<usize> {
        self.episode_list_requests()
            .iter()
            .map(|r| query_number(&r.query, "pg", 0))
            .collect()
    }
}

fn query_number(query: &HashMap<String, String>, key: &str, default: usize) -> usize {
    query
        .get(key)
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn episode_json(podcast_id: &str, podcast: &FakePodcast, episode: &FakeEpisode, full: bool) -> Value {
    let mut value = json!({
        "id": episode.id,
        "title": episode.title,
        "description": format!("Summary of {}", episode.id),
        "episode_raw_url": format!("https://cdn.example.com/{}.mp3", episode.id),
        "date": format!("2024-01-{:02}T{:02}:00:00+00:00", 1 + episode.number / 24 % 28, episode.number % 24),
        "milliseconds": 125_000,
        "parent": {"id": podcast_id, "title": podcast.title},
    });
    if full && let Some(content) = &episode.content {
        value["content_html"] = json!(content);
    }
    value
}

fn list_body(total: usize, items: Vec<Value>) -> Value {
    json!({"head": {"status": 200, "data": {"total": total}}, "data": items})
}

fn paginate<T: Clone>(items: &[T], page: usize, hits: usize) -> Vec<T> {
    items
        .iter()
        .skip(page.saturating_sub(1) * hits)
        .take(hits)
        .cloned()
        .collect()
}

fn respond(status: u16, body: impl Into<Bytes>) -> HttpResponse {
    HttpResponse {
        status,
        body: body.into(),
    }
}

impl FakeState {
    fn route(&self, segments: &[String], query: &HashMap<String, String>) -> HttpResponse {
        let page = query_number(query, "pg", 1);
        let hits = query_number(query, "hits", 500);

        let body = match segments {
            [] => {
                let all: Vec<Value> = self
                    .podcasts
                    .iter()
                    .map(|(id, p)| json!({"id": id, "title": p.title, "description": "", "image": ""}))
                    .collect();
                list_body(all.len(), paginate(&all, page, hits))
            }
            [latest] if latest == "latest" => {
                let items = self
                    .podcasts
                    .iter()
                    .filter_map(|(id, p)| p.episodes.last().map(|e| episode_json(id, p, e, false)))
                    .collect::<Vec<_>>();
                list_body(items.len(), items)
            }
            [batch] if batch == "episodes" => {
                let wanted: HashSet<&str> = query
                    .get("ids")
                    .map(|ids| ids.split(',').collect())
                    .unwrap_or_default();
                let items = self
                    .podcasts
                    .iter()
                    .flat_map(|(id, p)| p.episodes.iter().map(move |e| (id, p, e)))
                    .filter(|(_, _, e)| {
                        wanted.contains(e.id.as_str()) && !self.hidden_from_batch.contains(&e.id)
                    })
                    .map(|(id, p, e)| episode_json(id, p, e, true))
                    .collect::<Vec<_>>();
                list_body(items.len(), items)
            }
            [podcast_id] => {
                let Some(podcast) = self.podcasts.get(podcast_id) else {
                    return respond(404, "no such podcast");
                };
                let total = podcast.announced_total.unwrap_or(podcast.episodes.len());
                let items = if self.empty_pages.contains(&page) {
                    Vec::new()
                } else {
                    // Newest first, like the real listing
                    let newest_first: Vec<&FakeEpisode> = podcast.episodes.iter().rev().collect();
                    paginate(&newest_first, page, hits)
                        .into_iter()
                        .map(|e| episode_json(podcast_id, podcast, e, true))
                        .collect()
                };
                list_body(total, items)
            }
            [podcast_id, episode_id] => {
                let found = self.podcasts.get(podcast_id).and_then(|p| {
                    p.episodes
                        .iter()
                        .find(|e| &e.id == episode_id)
                        .map(|e| episode_json(podcast_id, p, e, true))
                });
                match found {
                    Some(episode) => json!({"data": episode}),
                    None => return respond(404, "no such episode"),
                }
            }
            _ => return respond(404, "unknown route"),
        };

        respond(200, body.to_string())
    }
}

#[async_trait]
impl HttpClient for FakeApi {
    async fn get(
        &self,
        url: &Url,
        headers: &[(&str, String)],
    ) -> Result<HttpResponse, reqwest::Error> {
        let mut state = self.lock();

        let base_path = format!("{}/", Url::parse(BASE_URL).unwrap().path());
        let segments: Vec<String> = url
            .path()
            .strip_prefix(base_path.as_str())
            .unwrap_or_default()
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let query: HashMap<String, String> = url.query_pairs().into_owned().collect();

        state.requests.push(Recorded {
            segments: segments.clone(),
            query: query.clone(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        });

        if !state.fail_next.is_empty() {
            let status = state.fail_next.remove(0);
            return Ok(respond(status, "upstream failure"));
        }
        if let Some(status) = state.fail_with {
            return Ok(respond(status, "upstream failure"));
        }
        if state.malformed {
            return Ok(respond(200, r#"{"unexpected": true}"#));
        }

        Ok(state.route(&segments, &query))
    }

    async fn post_form(
        &self,
        _url: &Url,
        form: &[(&str, &str)],
    ) -> Result<HttpResponse, reqwest::Error> {
        let mut state = self.lock();
        assert!(form.contains(&("username", "user")));

        if state.reject_logins {
            return Ok(respond(401, "bad credentials"));
        }
        state.logins += 1;
        let mut body = json!({"data": {"data": {"token": format!("token-{}", state.logins)}}});
        if let Some(secs) = state.login_expires_in {
            body["expires_in"] = json!(secs);
        }
        Ok(respond(200, body.to_string()))
    }
}
