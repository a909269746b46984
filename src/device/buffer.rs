/*
 *  device/buffer.rs
 *
 *  ledwire - pixels on the wire
 *  (c) 2020-26 Stuart Hunter
 *
 *  Transfer buffers and the host buffer-copy policy
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  See <http://www.gnu.org/licenses/> to get a copy of the GNU General
 *  Public License.
 *
 */

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::device::error::BufferError;

/// Lifecycle of a transfer buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferState {
    /// Available for staging
    Free,
    /// Holds data waiting for submission
    Staged,
    /// Storage belongs to the hardware stack until completion
    InFlight,
    /// Hardware finished with it; waiting for `flush()` to recycle
    Completed,
}

impl BufferState {
    /// Whether `self -> to` is a legal lifecycle step
    pub fn can_become(self, to: BufferState) -> bool {
        use BufferState::*;
        matches!(
            (self, to),
            (Free, Staged)
                | (Staged, Staged)
                | (Staged, InFlight)
                | (Staged, Free)
                | (InFlight, Completed)
                | (Completed, Free)
        )
    }
}

/// Whether staged data is duplicated before it is handed to the hardware stack.
///
/// Some USB stacks copy user memory into the kernel at submission, others map
/// it and read it while the transfer is queued. On the latter any write after
/// submission tears the frame on the wire, so we submit a private copy there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferPolicy {
    /// Duplicate on submit; the staged buffer is free again immediately
    #[serde(rename = "copy")]
    CopyOnSubmit,
    /// Hand the staged storage itself to the stack; untouched until completion
    #[serde(rename = "nocopy")]
    NoCopyNeeded,
}

impl BufferPolicy {
    /// The policy the host's USB stack calls for
    pub fn for_host() -> Self {
        if cfg!(target_os = "linux") {
            BufferPolicy::NoCopyNeeded
        } else {
            BufferPolicy::CopyOnSubmit
        }
    }

    pub fn copies(self) -> bool {
        self == BufferPolicy::CopyOnSubmit
    }
}

impl fmt::Display for BufferPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferPolicy::CopyOnSubmit => write!(f, "copy"),
            BufferPolicy::NoCopyNeeded => write!(f, "nocopy"),
        }
    }
}

impl FromStr for BufferPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "copy" => Ok(BufferPolicy::CopyOnSubmit),
            "nocopy" => Ok(BufferPolicy::NoCopyNeeded),
            "host" => Ok(BufferPolicy::for_host()),
            other => Err(format!("unknown buffer policy '{}' (copy|nocopy|host)", other)),
        }
    }
}

/// Fixed-capacity byte buffer with an explicit lifecycle.
///
/// While `InFlight` the storage is physically absent (it was moved to the
/// hardware stack), so nothing on the application side can alias it.
#[derive(Debug)]
pub struct TransferBuffer {
    storage: Option<Vec<u8>>,
    len: usize,
    capacity: usize,
    state: BufferState,
}

impl TransferBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            storage: Some(vec![0; capacity]),
            len: 0,
            capacity,
            state: BufferState::Free,
        }
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Staged bytes, `None` while the storage is lent out
    pub fn bytes(&self) -> Option<&[u8]> {
        self.storage.as_deref().map(|s| &s[..self.len])
    }

    fn transition(&mut self, to: BufferState) -> Result<(), BufferError> {
        if !self.state.can_become(to) {
            return Err(BufferError::IllegalTransition { from: self.state, to });
        }
        self.state = to;
        Ok(())
    }

    /// Copy `data` in. Legal from `Free`, or `Staged` to replace unsent data.
    pub fn stage(&mut self, data: &[u8]) -> Result<(), BufferError> {
        if data.len() > self.capacity {
            return Err(BufferError::Oversize { len: data.len(), capacity: self.capacity });
        }
        if !self.state.can_become(BufferState::Staged) {
            return Err(BufferError::IllegalTransition { from: self.state, to: BufferState::Staged });
        }
        let storage = self.storage.as_mut().ok_or(BufferError::StorageLent)?;
        storage[..data.len()].copy_from_slice(data);
        self.len = data.len();
        self.transition(BufferState::Staged)
    }

    /// Drop the staged data without sending it; `Staged -> Free`.
    /// The copy policy calls this once the stack has taken its own copy.
    pub fn release(&mut self) -> Result<(), BufferError> {
        if self.state != BufferState::Staged {
            return Err(BufferError::IllegalTransition { from: self.state, to: BufferState::Free });
        }
        self.transition(BufferState::Free)?;
        self.len = 0;
        Ok(())
    }

    /// Move the staged storage out for zero-copy submission.
    ///
    /// The buffer stays `Staged` until [`mark_in_flight`](Self::mark_in_flight)
    /// confirms the stack accepted it, or [`restore`](Self::restore) hands a
    /// rejected submission back.
    pub fn lend(&mut self) -> Result<Vec<u8>, BufferError> {
        if self.state != BufferState::Staged {
            return Err(BufferError::IllegalTransition { from: self.state, to: BufferState::InFlight });
        }
        let mut storage = self.storage.take().ok_or(BufferError::StorageLent)?;
        storage.truncate(self.len);
        Ok(storage)
    }

    pub fn mark_in_flight(&mut self) -> Result<(), BufferError> {
        if self.storage.is_some() {
            return Err(BufferError::IllegalTransition { from: self.state, to: BufferState::InFlight });
        }
        self.transition(BufferState::InFlight)
    }

    /// Take back storage from a submission the stack refused
    pub fn restore(&mut self, storage: Vec<u8>) {
        self.storage = Some(self.reshape(storage));
    }

    /// Storage came back from the hardware stack
    pub fn complete(&mut self, storage: Vec<u8>) -> Result<(), BufferError> {
        self.transition(BufferState::Completed)?;
        self.storage = Some(self.reshape(storage));
        Ok(())
    }

    /// `Completed -> Free`
    pub fn recycle(&mut self) -> Result<(), BufferError> {
        self.transition(BufferState::Free)?;
        self.len = 0;
        Ok(())
    }

    fn reshape(&self, mut storage: Vec<u8>) -> Vec<u8> {
        storage.resize(self.capacity, 0);
        storage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [BufferState; 4] = [
        BufferState::Free,
        BufferState::Staged,
        BufferState::InFlight,
        BufferState::Completed,
    ];

    #[test]
    fn test_in_flight_never_returns_to_staged() {
        assert!(!BufferState::InFlight.can_become(BufferState::Staged));
        assert!(!BufferState::InFlight.can_become(BufferState::Free));
        assert!(!BufferState::Completed.can_become(BufferState::Staged));
    }

    #[test]
    fn test_every_state_has_an_exit() {
        for from in ALL {
            assert!(ALL.iter().any(|&to| from.can_become(to)), "{:?} is a dead end", from);
        }
    }

    #[test]
    fn test_zero_copy_lifecycle() {
        let mut buf = TransferBuffer::new(8);
        buf.stage(&[1, 2, 3]).unwrap();
        let lent = buf.lend().unwrap();
        assert_eq!(lent, vec![1, 2, 3]);
        buf.mark_in_flight().unwrap();

        // no writes while the stack owns it
        assert_eq!(
            buf.stage(&[9]),
            Err(BufferError::IllegalTransition { from: BufferState::InFlight, to: BufferState::Staged })
        );
        assert!(buf.bytes().is_none());

        buf.complete(lent).unwrap();
        assert_eq!(buf.state(), BufferState::Completed);
        assert_eq!(buf.bytes(), Some(&[1, 2, 3][..]));
        buf.recycle().unwrap();
        assert_eq!(buf.state(), BufferState::Free);
        assert_eq!(buf.bytes().map(|b| b.len()), Some(0));
    }

    #[test]
    fn test_copy_releases_immediately() {
        let mut buf = TransferBuffer::new(4);
        buf.stage(&[7, 7]).unwrap();
        let copy = buf.bytes().map(<[u8]>::to_vec).unwrap();
        buf.release().unwrap();
        assert_eq!(buf.state(), BufferState::Free);
        buf.stage(&[1]).unwrap();
        assert_eq!(copy, vec![7, 7]);
    }

    #[test]
    fn test_release_only_from_staged() {
        let mut buf = TransferBuffer::new(4);
        assert!(buf.release().is_err());
        buf.stage(&[1]).unwrap();
        let _lent = buf.lend().unwrap();
        buf.mark_in_flight().unwrap();
        assert_eq!(
            buf.release(),
            Err(BufferError::IllegalTransition { from: BufferState::InFlight, to: BufferState::Free })
        );
    }

    #[test]
    fn test_rejected_submission_stays_staged() {
        let mut buf = TransferBuffer::new(4);
        buf.stage(&[5, 6]).unwrap();
        let lent = buf.lend().unwrap();
        buf.restore(lent);
        assert_eq!(buf.state(), BufferState::Staged);
        assert_eq!(buf.bytes(), Some(&[5, 6][..]));
        assert_eq!(buf.capacity(), 4);
    }

    #[test]
    fn test_oversize_stage_rejected() {
        let mut buf = TransferBuffer::new(2);
        assert_eq!(buf.stage(&[0; 3]), Err(BufferError::Oversize { len: 3, capacity: 2 }));
        assert_eq!(buf.state(), BufferState::Free);
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("copy".parse::<BufferPolicy>(), Ok(BufferPolicy::CopyOnSubmit));
        assert_eq!("NoCopy".parse::<BufferPolicy>(), Ok(BufferPolicy::NoCopyNeeded));
        assert_eq!("host".parse::<BufferPolicy>(), Ok(BufferPolicy::for_host()));
        assert!("sometimes".parse::<BufferPolicy>().is_err());
    }
}
