use ulid::Ulid;

use crate::limits::MAX_COMMENT_LEN;
use crate::model::*;
use crate::validate;

use super::{invalid, now_ms, require_user, Engine, EngineError};

impl Engine {
    /// Fill in a review slot opened by a completed stay. Each slot takes one
    /// submission.
    pub async fn submit_review(
        &self,
        session: &Session,
        review_id: Ulid,
        rating: i64,
        comment: &str,
    ) -> Result<Review, EngineError> {
        let user_id = require_user(session)?;
        let rating = validate::rating(rating).map_err(invalid)?;
        validate::non_empty("comment", comment, MAX_COMMENT_LEN).map_err(invalid)?;

        let _catalog = self.catalog_lock.lock().await;
        let (owner, done) = self
            .store
            .reviews
            .get(&review_id)
            .map(|r| (r.user_id, r.done))
            .ok_or(EngineError::NotFound("review", review_id))?;
        if owner != user_id {
            return Err(EngineError::Forbidden("review belongs to another user"));
        }
        if done {
            return Err(EngineError::AlreadyExists("review", review_id));
        }
        self.persist(&Event::ReviewSubmitted {
            id: review_id,
            rating,
            comment: comment.trim().to_string(),
            at: now_ms(),
        })
        .await?;
        self.store
            .reviews
            .get(&review_id)
            .map(|r| r.clone())
            .ok_or(EngineError::NotFound("review", review_id))
    }

    fn review_info(&self, review: Review) -> ReviewInfo {
        let (property_name, category_id) = self
            .store
            .properties
            .get(&review.property_id)
            .map(|p| (p.name.clone(), Some(p.category_id)))
            .unwrap_or_default();
        let location = category_id
            .and_then(|id| self.store.categories.get(&id).map(|c| c.location.clone()))
            .unwrap_or_default();
        let user_name = self
            .store
            .users
            .get(&review.user_id)
            .map(|u| u.name.clone())
            .unwrap_or_default();
        ReviewInfo {
            review,
            property_name,
            location,
            user_name,
        }
    }

    /// Submitted reviews of a property, most recent first.
    pub fn property_reviews(&self, property_id: Ulid) -> Result<Vec<ReviewInfo>, EngineError> {
        if !self.store.properties.contains_key(&property_id) {
            return Err(EngineError::NotFound("property", property_id));
        }
        let mut reviews: Vec<Review> = self
            .store
            .reviews
            .iter()
            .filter(|r| r.property_id == property_id && r.done)
            .map(|r| r.clone())
            .collect();
        reviews.sort_by_key(|r| std::cmp::Reverse((r.updated_at, r.id)));
        Ok(reviews.into_iter().map(|r| self.review_info(r)).collect())
    }

    /// Every review slot of a user, open ones included.
    pub fn user_reviews(&self, user_id: Ulid) -> Vec<ReviewInfo> {
        let mut reviews: Vec<Review> = self
            .store
            .reviews
            .iter()
            .filter(|r| r.user_id == user_id)
            .map(|r| r.clone())
            .collect();
        reviews.sort_by_key(|r| std::cmp::Reverse((r.created_at, r.id)));
        reviews.into_iter().map(|r| self.review_info(r)).collect()
    }
}
