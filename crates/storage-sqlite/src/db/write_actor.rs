//! Every write goes through one dedicated connection, one immediate transaction
//! per job. Readers use the pool directly.

use diesel::SqliteConnection;
use log::{debug, error};
use tokio::sync::{mpsc, oneshot};

use ledgerly_core::{Error, Result};

use super::DbPool;
use crate::errors::StorageError;

type Job = Box<dyn FnOnce(&mut SqliteConnection) + Send + 'static>;

#[derive(Clone)]
pub struct WriteHandle {
    tx: mpsc::UnboundedSender<Job>,
}

impl WriteHandle {
    /// Run `job` inside an immediate transaction on the writer connection. An
    /// `Err` from the job rolls the transaction back.
    pub async fn exec<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let wrapped: Job = Box::new(move |conn| {
            let result = conn
                .immediate_transaction::<T, StorageError, _>(|tx| {
                    job(tx).map_err(StorageError::Domain)
                })
                .map_err(Error::from);
            let _ = reply_tx.send(result);
        });

        self.tx
            .send(wrapped)
            .map_err(|_| StorageError::WriterUnavailable("writer thread has stopped".to_string()))?;
        reply_rx.await.map_err(|_| {
            Error::from(StorageError::WriterUnavailable(
                "writer dropped the job".to_string(),
            ))
        })?
    }
}

pub fn spawn_writer(pool: DbPool) -> WriteHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
    let spawned = std::thread::Builder::new()
        .name("ledgerly-db-writer".to_string())
        .spawn(move || {
            let mut conn = match pool.get() {
                Ok(conn) => conn,
                Err(err) => {
                    error!("Writer could not acquire a connection: {}", err);
                    return;
                }
            };
            while let Some(job) = rx.blocking_recv() {
                job(&mut *conn);
            }
            debug!("Writer thread exiting");
        });
    if let Err(err) = spawned {
        error!("Failed to spawn writer thread: {}", err);
    }
    WriteHandle { tx }
}
