pub mod budget;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod feed;
pub mod http;
pub mod model;
pub mod store;
pub mod sync;
pub mod upstream;

// Re-export main types for convenience
pub use budget::{CallBudget, MinInterval, TokenBucket};
pub use cache::{CacheLayer, Directory, DirectoryEntry, TtlCache};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::Config;
pub use error::{ConfigError, FeedError, StoreError, SyncError, UpstreamError};
pub use feed::{FeedOptions, format_duration, render_rdf, render_rss, sanitize_text};
pub use http::{HttpClient, HttpResponse, ReqwestClient};
pub use model::{DescriptionSource, Episode, EpisodeUpsert, Podcast, PodcastFields};
pub use store::{JsonStore, MemoryStore, Store};
pub use sync::{BackfillReport, PodcastEpisodes, SearchHit, SyncEngine, SyncOptions};
pub use upstream::{UpstreamClient, UpstreamOptions, parse_date};
