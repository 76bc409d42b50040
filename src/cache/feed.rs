use crate::models::FeedPost;

/// Flip the like on the cached copy of `post_id`, moving the counter from the
/// cached value.
pub fn apply_optimistic_toggle(posts: &mut [FeedPost], post_id: i64) {
    if let Some(post) = posts.iter_mut().find(|p| p.id == post_id) {
        post.likes_count += if post.is_liked { -1 } else { 1 };
        post.is_liked = !post.is_liked;
    }
}

/// Replace the cached row with the one the store returned.
pub fn reconcile_post(posts: &mut [FeedPost], updated: &FeedPost) {
    if let Some(post) = posts.iter_mut().find(|p| p.id == updated.id) {
        *post = updated.clone();
    }
}
