use crate::{connection::Connection, Result};

/// A transaction over a borrowed connection.
///
/// Unlike a sqlx transaction it does not roll back on drop; callers end it with
/// [`commit`](Self::commit), [`rollback`](Self::rollback) or
/// [`finish`](Self::finish), which picks one from the result of the work done.
///
/// # Example
///
/// ```rust,ignore
/// let mut conn = pool.get_connection().await?;
/// let mut tx = Transaction::begin(&mut *conn).await?;
/// let result = do_work(tx.connection()).await;
/// tx.finish(result).await?;
/// ```
pub struct Transaction<'c> {
    conn: &'c mut dyn Connection,
}

impl<'c> Transaction<'c> {
    pub async fn begin(conn: &'c mut dyn Connection) -> Result<Self> {
        conn.begin().await?;
        Ok(Self { conn })
    }

    /// The connection statements of this transaction run on.
    pub fn connection(&mut self) -> &mut dyn Connection {
        &mut *self.conn
    }

    pub async fn commit(self) -> Result<()> {
        self.conn.commit().await
    }

    pub async fn rollback(self) -> Result<()> {
        self.conn.rollback().await
    }

    /// Commits on `Ok`, rolls back on `Err` and passes the result through.
    pub async fn finish<T>(self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self.rollback().await {
                    log::warn!("rollback failed: {}", rollback);
                }
                Err(e)
            }
        }
    }
}
