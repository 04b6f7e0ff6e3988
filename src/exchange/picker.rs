use crate::error::PickError;
use serde::Serialize;

/// Engine-side state of one piece while downloading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PieceAssignment {
    Unassigned,
    Assigned,
    BeingValidated,
    Downloaded,
}

/// Pick the unassigned piece with the highest priority.
///
/// Ties go to the lowest index.
pub fn pick<F>(pieces: &[PieceAssignment], priority_of: F) -> Result<u32, PickError>
where
    F: Fn(u32) -> i32,
{
    let mut picked: Option<(u32, i32)> = None;

    for (index, state) in pieces.iter().enumerate() {
        if *state != PieceAssignment::Unassigned {
            continue;
        }

        let index = index as u32;
        let priority = priority_of(index);

        match picked {
            Some((_, best)) if priority <= best => {}
            _ => picked = Some((index, priority)),
        }
    }

    picked.map(|(index, _)| index).ok_or(PickError::NoPieceAvailable)
}
