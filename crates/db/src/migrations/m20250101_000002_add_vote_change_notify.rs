//! Publish vote inserts and deletes on the `vote_changes` notification channel.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Payload carries no voter data, only what changed and where.
        manager
            .get_connection()
            .execute_unprepared(
                r"
                CREATE OR REPLACE FUNCTION notify_vote_change() RETURNS trigger AS $$
                DECLARE
                    changed_room TEXT;
                BEGIN
                    IF TG_OP = 'DELETE' THEN
                        changed_room := OLD.room_id;
                    ELSE
                        changed_room := NEW.room_id;
                    END IF;
                    PERFORM pg_notify(
                        'vote_changes',
                        json_build_object('op', lower(TG_OP), 'room_id', changed_room)::text
                    );
                    RETURN NULL;
                END;
                $$ LANGUAGE plpgsql;
                ",
            )
            .await?;

        manager
            .get_connection()
            .execute_unprepared("DROP TRIGGER IF EXISTS vote_change_notify ON vote")
            .await?;

        manager
            .get_connection()
            .execute_unprepared(
                r"
                CREATE TRIGGER vote_change_notify
                AFTER INSERT OR DELETE ON vote
                FOR EACH ROW EXECUTE FUNCTION notify_vote_change();
                ",
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .get_connection()
            .execute_unprepared("DROP TRIGGER IF EXISTS vote_change_notify ON vote")
            .await?;

        manager
            .get_connection()
            .execute_unprepared("DROP FUNCTION IF EXISTS notify_vote_change()")
            .await?;

        Ok(())
    }
}
