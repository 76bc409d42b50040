mod post;
mod user;

pub use post::{FeedPost, LikeCounter};
pub use user::{User, UserId};
