//! Vote repository.

use std::sync::Arc;

use crate::entities::{Vote, vote};
use chrono::Utc;
use tally_common::{AppError, AppResult, IdGenerator};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
};

/// Vote repository for database operations.
#[derive(Clone)]
pub struct VoteRepository {
    db: Arc<DatabaseConnection>,
    id_gen: IdGenerator,
}

impl VoteRepository {
    /// Create a new vote repository.
    #[must_use]
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            db,
            id_gen: IdGenerator::new(),
        }
    }

    /// Get every ballot cast in a room.
    pub async fn find_by_room(&self, room_id: &str) -> AppResult<Vec<vote::Model>> {
        Vote::find()
            .filter(vote::Column::RoomId.eq(room_id))
            .all(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Get the choices of every ballot in a room, in no particular order.
    pub async fn find_choices_by_room(&self, room_id: &str) -> AppResult<Vec<bool>> {
        let votes = self.find_by_room(room_id).await?;
        Ok(votes.into_iter().map(|v| v.choice).collect())
    }

    /// Record a new ballot.
    pub async fn create(&self, room_id: &str, choice: bool) -> AppResult<vote::Model> {
        let model = vote::ActiveModel {
            id: Set(self.id_gen.generate()),
            room_id: Set(room_id.to_string()),
            choice: Set(choice),
            created_at: Set(Utc::now().into()),
        };

        model
            .insert(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Delete every ballot in a room, returning how many were removed.
    pub async fn delete_by_room(&self, room_id: &str) -> AppResult<u64> {
        let result = Vote::delete_many()
            .filter(vote::Column::RoomId.eq(room_id))
            .exec(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(result.rows_affected)
    }
}
