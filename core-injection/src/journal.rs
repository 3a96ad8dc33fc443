//! Write-ahead list of applied device steps and their compensation.
//!
//! The device media database has no multi-step transaction primitive, so each
//! step that may have taken effect is recorded here before the next one runs.
//! On failure the log is unwound in reverse order with the transport's
//! compensation primitives.

use bridge_traits::error::TransportResult;
use bridge_traits::{DeviceTransport, PlaylistOperation, SessionHandle};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AppliedStep {
    Uploaded {
        locator: String,
    },
    RecordWritten {
        fingerprint: String,
    },
    /// `inverse` restores the playlist to its state before the operation.
    PlaylistOp {
        playlist: String,
        inverse: Vec<PlaylistOperation>,
    },
}

#[derive(Debug, Default)]
pub(crate) struct WriteAheadLog {
    steps: Vec<AppliedStep>,
}

impl WriteAheadLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, step: AppliedStep) {
        self.steps.push(step);
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Undo every recorded step, newest first.
    ///
    /// Compensated steps are popped as they succeed; on error the log keeps
    /// the steps that still need undoing.
    pub async fn rollback(
        &mut self,
        transport: &dyn DeviceTransport,
        session: &SessionHandle,
    ) -> TransportResult<()> {
        while let Some(step) = self.steps.last() {
            match step {
                AppliedStep::Uploaded { locator } => {
                    transport.remove_file(session, locator).await?;
                }
                AppliedStep::RecordWritten { fingerprint } => {
                    transport.remove_record(session, fingerprint).await?;
                }
                AppliedStep::PlaylistOp { playlist, inverse } => {
                    apply_compensation(transport, session, playlist, inverse).await?;
                }
            }
            debug!(step = ?step, "Compensated device step");
            self.steps.pop();
        }
        Ok(())
    }
}

async fn apply_compensation(
    transport: &dyn DeviceTransport,
    session: &SessionHandle,
    playlist: &str,
    inverse: &[PlaylistOperation],
) -> TransportResult<()> {
    let tx = transport.begin_write(session).await?;
    for op in inverse {
        if let Err(e) = transport.apply_playlist_op(&tx, playlist, op).await {
            if let Err(abort) = transport.abort(&tx).await {
                warn!(error = %abort, "Abort of compensation transaction failed");
            }
            return Err(e);
        }
    }
    transport.commit(&tx).await
}

/// Operations that undo `op` when applied to the playlist it produced.
///
/// `before` is the member list ahead of `op`, or `None` if the playlist does
/// not exist yet.
pub(crate) fn inverse_of(op: &PlaylistOperation, before: Option<&[String]>) -> Vec<PlaylistOperation> {
    let predecessor = |fingerprint: &str| -> Option<String> {
        let members = before?;
        let index = members.iter().position(|m| m == fingerprint)?;
        index.checked_sub(1).map(|i| members[i].clone())
    };

    match op {
        PlaylistOperation::Create => vec![PlaylistOperation::Delete],
        PlaylistOperation::Delete => {
            let mut restore = vec![PlaylistOperation::Create];
            let mut after = None;
            for member in before.unwrap_or_default() {
                restore.push(PlaylistOperation::Add {
                    fingerprint: member.clone(),
                    after: after.clone(),
                });
                after = Some(member.clone());
            }
            restore
        }
        PlaylistOperation::Add { fingerprint, .. } => vec![PlaylistOperation::Remove {
            fingerprint: fingerprint.clone(),
        }],
        PlaylistOperation::Remove { fingerprint } => vec![PlaylistOperation::Add {
            fingerprint: fingerprint.clone(),
            after: predecessor(fingerprint),
        }],
        PlaylistOperation::Move { fingerprint, .. } => vec![PlaylistOperation::Move {
            fingerprint: fingerprint.clone(),
            after: predecessor(fingerprint),
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    /// Apply `op`, then its inverse, and return the resulting members.
    fn round_trip(op: PlaylistOperation, start: &[&str]) -> Vec<String> {
        let before = members(start);
        let inverse = inverse_of(&op, Some(&before));

        let mut list = before.clone();
        op.apply_to(&mut list).unwrap();
        for undo in inverse {
            match undo {
                PlaylistOperation::Create => list.clear(),
                other => other.apply_to(&mut list).unwrap(),
            }
        }
        list
    }

    #[test]
    fn test_add_is_undone_by_remove() {
        let op = PlaylistOperation::Add {
            fingerprint: "x".into(),
            after: Some("a".into()),
        };
        assert_eq!(round_trip(op, &["a", "b"]), members(&["a", "b"]));
    }

    #[test]
    fn test_remove_restores_previous_position() {
        let op = PlaylistOperation::Remove {
            fingerprint: "b".into(),
        };
        assert_eq!(round_trip(op, &["a", "b", "c"]), members(&["a", "b", "c"]));

        let head = PlaylistOperation::Remove {
            fingerprint: "a".into(),
        };
        assert_eq!(round_trip(head, &["a", "b"]), members(&["a", "b"]));
    }

    #[test]
    fn test_move_is_undone_by_moving_back() {
        let op = PlaylistOperation::Move {
            fingerprint: "c".into(),
            after: None,
        };
        assert_eq!(round_trip(op, &["a", "b", "c"]), members(&["a", "b", "c"]));
    }

    #[test]
    fn test_delete_restores_members_in_order() {
        let before = members(&["a", "b"]);
        let inverse = inverse_of(&PlaylistOperation::Delete, Some(&before));

        assert_eq!(
            inverse,
            vec![
                PlaylistOperation::Create,
                PlaylistOperation::Add {
                    fingerprint: "a".into(),
                    after: None
                },
                PlaylistOperation::Add {
                    fingerprint: "b".into(),
                    after: Some("a".into())
                },
            ]
        );
        assert_eq!(
            inverse_of(&PlaylistOperation::Create, None),
            vec![PlaylistOperation::Delete]
        );
    }

    #[test]
    fn test_log_tracks_steps() {
        let mut log = WriteAheadLog::new();
        assert!(log.is_empty());
        log.record(AppliedStep::Uploaded {
            locator: "Media/x.wav".into(),
        });
        log.record(AppliedStep::RecordWritten {
            fingerprint: "x".into(),
        });
        assert_eq!(log.len(), 2);
    }
}
