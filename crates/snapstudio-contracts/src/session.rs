use uuid::Uuid;

use crate::image::ImageRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("no source image loaded")]
    InvalidState,
    #[error("session moved on while the edit was in flight")]
    Stale,
}

/// Snapshot of the session taken when an edit is issued.
///
/// The result of that edit may only be recorded while the session still has
/// the same lineage and revision; anything else means a newer upload or edit
/// got there first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditTicket {
    pub lineage: u64,
    pub revision: u64,
    pub source: ImageRef,
}

/// Original image, latest edit and the linear edit history.
///
/// `current` is only ever set by edit results. Loading a new source clears it
/// together with the history and starts a new lineage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    session_id: String,
    original: Option<ImageRef>,
    current: Option<ImageRef>,
    history: Vec<ImageRef>,
    lineage: u64,
    revision: u64,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            original: None,
            current: None,
            history: Vec::new(),
            lineage: 0,
            revision: 0,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn original(&self) -> Option<&ImageRef> {
        self.original.as_ref()
    }

    pub fn current(&self) -> Option<&ImageRef> {
        self.current.as_ref()
    }

    pub fn history(&self) -> &[ImageRef] {
        &self.history
    }

    pub fn lineage(&self) -> u64 {
        self.lineage
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn load_source(&mut self, image: ImageRef) -> &Self {
        self.original = Some(image);
        self.current = None;
        self.history.clear();
        self.lineage += 1;
        self.revision = 0;
        self
    }

    /// Edits are cumulative: the latest result if there is one, the original
    /// otherwise.
    pub fn current_source_for_edit(&self) -> Option<&ImageRef> {
        self.current.as_ref().or(self.original.as_ref())
    }

    pub fn record_edit(&mut self, result: ImageRef) -> Result<(), SessionError> {
        if self.original.is_none() {
            return Err(SessionError::InvalidState);
        }
        self.current = Some(result.clone());
        self.history.push(result);
        self.revision += 1;
        Ok(())
    }

    pub fn begin_edit(&self) -> Result<EditTicket, SessionError> {
        let source = self
            .current_source_for_edit()
            .cloned()
            .ok_or(SessionError::InvalidState)?;
        Ok(EditTicket {
            lineage: self.lineage,
            revision: self.revision,
            source,
        })
    }

    pub fn is_current(&self, ticket: &EditTicket) -> bool {
        ticket.lineage == self.lineage && ticket.revision == self.revision
    }

    pub fn complete_edit(
        &mut self,
        ticket: &EditTicket,
        result: ImageRef,
    ) -> Result<(), SessionError> {
        if !self.is_current(ticket) {
            return Err(SessionError::Stale);
        }
        self.record_edit(result)
    }
}
