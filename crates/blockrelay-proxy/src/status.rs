//! I/O completion translation
//!
//! Pure, stateless mapping from physical-service completion records to
//! client-visible results. Transport status is decided first; the finer
//! block status and qualifier only matter when the transport succeeded.
//! Media errors and remap requests also leave a sense-like diagnostic
//! record when the caller's diagnostic buffer has space.

use blockrelay_common::{
    BlockQualifier, BlockStatus, DiagnosticBuffer, DiagnosticInfo, Error, IoCompletion, IoOutcome,
    Result, TransportStatus,
};
use tracing::error;

/// Translate a completion into the client result, recording diagnostics
/// for media errors and remap requests.
pub fn translate(completion: &IoCompletion, diagnostics: &mut DiagnosticBuffer) -> Result<IoOutcome> {
    match completion.transport {
        TransportStatus::Ok => {}
        TransportStatus::TimedOut => return Err(Error::Timeout),
        TransportStatus::Canceled => return Err(Error::Canceled),
        TransportStatus::Busy | TransportStatus::NoSuchDevice => return Err(Error::NotReady),
        TransportStatus::InternalError => return Err(Error::IoFailed),
    }

    match completion.block {
        BlockStatus::Success => {
            if completion.qualifier == BlockQualifier::RemapRequired {
                diagnostics.push(DiagnosticInfo {
                    error_code: completion.error_code,
                    lba: completion.media_error_lba,
                });
                Ok(IoOutcome::RemapRequired)
            } else {
                Ok(IoOutcome::Success)
            }
        }
        BlockStatus::MediaError => {
            diagnostics.push(DiagnosticInfo {
                error_code: completion.error_code,
                lba: completion.media_error_lba,
            });
            Err(Error::MediaError {
                lba: completion.media_error_lba,
            })
        }
        BlockStatus::IoFailed => Err(Error::IoFailed),
        BlockStatus::Aborted => Err(Error::Canceled),
        BlockStatus::NotReady => Err(Error::NotReady),
        BlockStatus::InvalidRequest => Err(Error::InvalidRequest(
            "operation rejected by physical service".to_string(),
        )),
        BlockStatus::Invalid => {
            error!(?completion, "completion carries invalid block status");
            Err(Error::IoFailed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diag() -> DiagnosticBuffer {
        DiagnosticBuffer::with_capacity(4)
    }

    #[test]
    fn transport_failures_short_circuit() {
        let cases = [
            (TransportStatus::TimedOut, Error::Timeout),
            (TransportStatus::Canceled, Error::Canceled),
            (TransportStatus::Busy, Error::NotReady),
            (TransportStatus::NoSuchDevice, Error::NotReady),
            (TransportStatus::InternalError, Error::IoFailed),
        ];
        for (transport, expected) in cases {
            let completion = IoCompletion::transport_error(transport);
            let mut diagnostics = diag();
            assert_eq!(translate(&completion, &mut diagnostics), Err(expected));
            assert!(diagnostics.is_empty());
        }
    }

    #[test]
    fn success_paths() {
        let mut diagnostics = diag();
        assert_eq!(
            translate(&IoCompletion::success(), &mut diagnostics),
            Ok(IoOutcome::Success)
        );
        assert!(diagnostics.is_empty());

        let remap = IoCompletion {
            qualifier: BlockQualifier::RemapRequired,
            error_code: 0x31,
            media_error_lba: Some(77),
            ..IoCompletion::success()
        };
        assert_eq!(
            translate(&remap, &mut diagnostics),
            Ok(IoOutcome::RemapRequired)
        );
        assert_eq!(
            diagnostics.entries(),
            &[DiagnosticInfo {
                error_code: 0x31,
                lba: Some(77)
            }]
        );
    }

    #[test]
    fn media_error_records_diagnostic() {
        let completion = IoCompletion::block_error(BlockStatus::MediaError, 0x11, Some(1234));
        let mut diagnostics = diag();
        assert_eq!(
            translate(&completion, &mut diagnostics),
            Err(Error::MediaError { lba: Some(1234) })
        );
        assert_eq!(diagnostics.entries().len(), 1);
        assert_eq!(diagnostics.entries()[0].lba, Some(1234));
    }

    #[test]
    fn media_error_diagnostic_dropped_when_buffer_full() {
        let completion = IoCompletion::block_error(BlockStatus::MediaError, 0x11, Some(9));
        let mut diagnostics = DiagnosticBuffer::with_capacity(0);
        assert_eq!(
            translate(&completion, &mut diagnostics),
            Err(Error::MediaError { lba: Some(9) })
        );
        assert!(diagnostics.is_empty());
    }

    #[test]
    fn block_failures_map_to_taxonomy() {
        let cases = [
            (BlockStatus::IoFailed, Error::IoFailed),
            (BlockStatus::Aborted, Error::Canceled),
            (BlockStatus::NotReady, Error::NotReady),
            (BlockStatus::Invalid, Error::IoFailed),
        ];
        for (block, expected) in cases {
            let completion = IoCompletion::block_error(block, 0, None);
            assert_eq!(translate(&completion, &mut diag()), Err(expected));
        }
        let completion = IoCompletion::block_error(BlockStatus::InvalidRequest, 0, None);
        assert!(matches!(
            translate(&completion, &mut diag()),
            Err(Error::InvalidRequest(_))
        ));
    }
}
