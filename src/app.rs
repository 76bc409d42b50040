use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::cache::{apply_optimistic_toggle, reconcile_post, OptimisticCell, PendingMutation};
use crate::config::Config;
use crate::db::Repository;
use crate::error::{AppError, Result};
use crate::models::{FeedPost, LikeCounter, User, UserId};
use crate::tui::AppAction;

// Message for a finished like/unlike write
pub struct LikeResult {
    pub request_id: u64,
    pub post_id: i64,
    pub result: std::result::Result<FeedPost, String>,
}

type RefreshResult = std::result::Result<Vec<FeedPost>, String>;

pub struct App {
    // Data
    pub user: User,
    pub feed: OptimisticCell<Vec<FeedPost>>,

    // UI State
    pub selected_index: usize,
    pub show_help: bool,

    // Async state
    pub is_refreshing: bool,
    pending_likes: HashMap<u64, PendingMutation<Vec<FeedPost>>>,
    next_request_id: u64,
    like_rx: mpsc::Receiver<LikeResult>,
    like_tx: mpsc::Sender<LikeResult>,
    refresh_rx: mpsc::Receiver<RefreshResult>,
    refresh_tx: mpsc::Sender<RefreshResult>,

    // Services
    pub repository: Repository,
    like_counter: LikeCounter,
}

impl App {
    pub async fn new(config: &Config) -> Result<Self> {
        let repository = Repository::new(&config.db_path).await?;
        Self::with_repository(repository, config.user_id, config.like_counter).await
    }

    pub async fn with_repository(
        repository: Repository,
        user_id: UserId,
        like_counter: LikeCounter,
    ) -> Result<Self> {
        let user = repository
            .get_user(user_id)
            .await?
            .ok_or(AppError::UserNotFound(user_id.0))?;

        let mut feed = OptimisticCell::new();
        feed.set(repository.list_feed(user.id).await?);

        let (like_tx, like_rx) = mpsc::channel(16);
        let (refresh_tx, refresh_rx) = mpsc::channel(1);

        Ok(Self {
            user,
            feed,
            selected_index: 0,
            show_help: false,
            is_refreshing: false,
            pending_likes: HashMap::new(),
            next_request_id: 0,
            like_rx,
            like_tx,
            refresh_rx,
            refresh_tx,
            repository,
            like_counter,
        })
    }

    pub fn posts(&self) -> &[FeedPost] {
        self.feed.get().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn selected_post(&self) -> Option<&FeedPost> {
        self.posts().get(self.selected_index)
    }

    pub async fn handle_action(&mut self, action: AppAction) -> Result<bool> {
        match action {
            AppAction::Quit => return Ok(true),

            AppAction::MoveUp => {
                if self.selected_index > 0 {
                    self.selected_index -= 1;
                }
            }

            AppAction::MoveDown => {
                let len = self.posts().len();
                if len > 0 && self.selected_index < len - 1 {
                    self.selected_index += 1;
                }
            }

            AppAction::MoveToTop => {
                self.selected_index = 0;
            }

            AppAction::MoveToBottom => {
                self.selected_index = self.posts().len().saturating_sub(1);
            }

            AppAction::ToggleLike => {
                if let Some(post) = self.selected_post() {
                    let id = post.id;
                    self.toggle_like(id);
                }
            }

            AppAction::RefreshFeed => {
                self.feed.invalidate();
                self.refetch_if_stale();
            }

            AppAction::ShowHelp => {
                self.show_help = true;
            }

            AppAction::HideHelp => {
                self.show_help = false;
            }
        }

        Ok(false)
    }

    /// Flip the cached post right away and run the write in the background.
    /// The result is applied by `poll_like_results`.
    pub fn toggle_like(&mut self, post_id: i64) {
        let Some(post) = self.posts().iter().find(|p| p.id == post_id).cloned() else {
            return;
        };

        let pending = self
            .feed
            .begin(|posts| apply_optimistic_toggle(posts, post_id));
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        self.pending_likes.insert(request_id, pending);

        let repository = self.repository.clone();
        let user = self.user.id;
        let counter = self.like_counter;
        let tx = self.like_tx.clone();

        tokio::spawn(async move {
            let result = repository
                .toggle_like(post, user, counter)
                .await
                .map_err(|e| e.to_string());
            let _ = tx.send(LikeResult { request_id, post_id, result }).await;
        });
    }

    /// Poll for finished like/unlike writes (non-blocking)
    pub fn poll_like_results(&mut self) {
        while let Ok(result) = self.like_rx.try_recv() {
            self.settle_like(result);
        }
    }

    /// A failed write rolls the cache back and is only logged; nothing is
    /// shown to the user.
    fn settle_like(&mut self, like: LikeResult) {
        let Some(pending) = self.pending_likes.remove(&like.request_id) else {
            return;
        };

        self.feed
            .settle(pending, &like.result, |posts, updated| reconcile_post(posts, updated));

        if let Err(e) = &like.result {
            tracing::error!("Like/unlike failed for post {}: {}", like.post_id, e);
        }
    }

    /// Start a background re-read if the feed is stale. Waits while likes
    /// are in flight so a read cannot overwrite their optimistic state.
    pub fn refetch_if_stale(&mut self) {
        if !self.feed.is_stale() || self.is_refreshing || !self.pending_likes.is_empty() {
            return;
        }

        self.is_refreshing = true;

        let repository = self.repository.clone();
        let user = self.user.id;
        let tx = self.refresh_tx.clone();

        tokio::spawn(async move {
            let result = repository.list_feed(user).await.map_err(|e| e.to_string());
            let _ = tx.send(result).await;
        });
    }

    /// Poll for a finished feed re-read (non-blocking)
    pub fn poll_refresh_result(&mut self) {
        if let Ok(result) = self.refresh_rx.try_recv() {
            self.apply_refresh(result);
        }
    }

    fn apply_refresh(&mut self, result: RefreshResult) {
        self.is_refreshing = false;

        match result {
            // A like started after the read began; keep its optimistic state
            // and read again once it settles.
            Ok(_) if !self.pending_likes.is_empty() => {}
            Ok(posts) => {
                self.feed.set(posts);
                let len = self.posts().len();
                if self.selected_index >= len {
                    self.selected_index = len.saturating_sub(1);
                }
            }
            Err(e) => {
                tracing::error!("Failed to refresh feed: {}", e);
                self.feed.mark_fresh();
            }
        }
    }
}
