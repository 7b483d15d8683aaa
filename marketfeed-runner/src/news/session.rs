//! Exclusively-owned article extraction session.
//!
//! [`ScopedSession`] wraps whatever session the factory hands out. Before
//! every extraction it checks liveness and transparently recreates a dead
//! session; after `restart_every` articles it recreates preventively. The
//! underlying session is closed when the scope ends, including on unwind.

use marketfeed_core::data::FetchError;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One live extraction session (a browser, an HTTP client with cookies...).
pub trait ArticleSession: Send {
    /// Cheap liveness check; false means the session must be recreated.
    fn is_alive(&mut self) -> bool;

    /// Article text, paragraphs joined by blank lines.
    ///
    /// `ExternalArticle` for articles hosted elsewhere, `Extraction` when the
    /// page had no usable content, `SessionLost` when the session died
    /// mid-request.
    fn extract(&mut self, url: &str) -> Result<String, FetchError>;

    fn close(&mut self) {}
}

pub trait SessionFactory: Send + Sync {
    fn open(&self) -> Result<Box<dyn ArticleSession>, FetchError>;
}

pub struct ScopedSession<'f> {
    factory: &'f dyn SessionFactory,
    session: Option<Box<dyn ArticleSession>>,
    restart_every: usize,
    served: usize,
    restarts: usize,
}

impl<'f> ScopedSession<'f> {
    pub fn open(factory: &'f dyn SessionFactory, restart_every: usize) -> Result<Self, FetchError> {
        let session = factory.open()?;
        info!("extraction session opened");
        Ok(Self {
            factory,
            session: Some(session),
            restart_every: restart_every.max(1),
            served: 0,
            restarts: 0,
        })
    }

    /// Sessions recreated so far (dead, lost or preventive).
    pub fn restarts(&self) -> usize {
        self.restarts
    }

    /// Extract `url`, recreating the session first if it is dead.
    ///
    /// A `SessionLost` result discards the session so the next call starts
    /// from a fresh one.
    pub fn extract(&mut self, url: &str) -> Result<String, FetchError> {
        let session = self.ready()?;
        let result = session.extract(url);
        if let Err(FetchError::SessionLost(reason)) = &result {
            warn!(url, %reason, "session lost during extraction");
            self.discard();
        }
        result
    }

    /// Count a finished article; restarts preventively every `restart_every`.
    pub fn article_done(&mut self) {
        self.served += 1;
        if self.served % self.restart_every == 0 {
            info!(articles = self.served, "preventive session restart");
            if let Err(e) = self.recreate() {
                warn!(error = %e, "preventive restart failed; will retry before next article");
            }
        }
    }

    /// Pause the caller after a restart so the new session can settle.
    pub fn settle_delay() -> Duration {
        Duration::from_secs(2)
    }

    fn ready(&mut self) -> Result<&mut Box<dyn ArticleSession>, FetchError> {
        let alive = match self.session.as_mut() {
            Some(session) => session.is_alive(),
            None => false,
        };
        if !alive {
            warn!("extraction session not alive; recreating");
            self.recreate()?;
        }
        self.session
            .as_mut()
            .ok_or_else(|| FetchError::SessionLost("no session available".into()))
    }

    fn recreate(&mut self) -> Result<(), FetchError> {
        self.discard();
        let session = self.factory.open()?;
        self.session = Some(session);
        self.restarts += 1;
        debug!(restarts = self.restarts, "extraction session recreated");
        Ok(())
    }

    fn discard(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
        }
    }
}

impl Drop for ScopedSession<'_> {
    fn drop(&mut self) {
        if self.session.is_some() {
            self.discard();
            info!(restarts = self.restarts, "extraction session closed");
        }
    }
}
