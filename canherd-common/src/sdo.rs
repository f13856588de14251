//! SDO message codecs
//!
//! Defines the request and response messages of the SDO protocol subset the
//! master speaks: expedited and segmented transfers in both directions, plus
//! aborts. Block transfers are not part of this stack.

use int_enum::IntEnum;

use crate::messages::{CanFrame, CanId};

/// Client command specifiers (ccs) found in request frames
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ClientCommand {
    DownloadSegment = 0,
    InitiateDownload = 1,
    InitiateUpload = 2,
    UploadSegment = 3,
    Abort = 4,
}

impl TryFrom<u8> for ClientCommand {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use ClientCommand::*;
        match value {
            0 => Ok(DownloadSegment),
            1 => Ok(InitiateDownload),
            2 => Ok(InitiateUpload),
            3 => Ok(UploadSegment),
            4 => Ok(Abort),
            _ => Err(()),
        }
    }
}

/// Server command specifiers (scs) found in response frames
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ServerCommand {
    UploadSegment = 0,
    DownloadSegment = 1,
    Upload = 2,
    Download = 3,
    Abort = 4,
}

impl TryFrom<u8> for ServerCommand {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use ServerCommand::*;
        match value {
            0 => Ok(UploadSegment),
            1 => Ok(DownloadSegment),
            2 => Ok(Upload),
            3 => Ok(Download),
            4 => Ok(Abort),
            _ => Err(()),
        }
    }
}

/// SDO abort codes
///
/// The master classifies aborts as a terminal transfer error; the code is
/// carried for diagnostics but not otherwise interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntEnum)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum AbortCode {
    /// Toggle bit not alternated
    ToggleNotAlternated = 0x0503_0000,
    /// SDO protocol timed out
    SdoTimeout = 0x0504_0000,
    /// Client/server command specifier not valid or unknown
    InvalidCommandSpecifier = 0x0504_0001,
    /// Out of memory
    OutOfMemory = 0x0504_0005,
    /// Unsupported access to an object
    UnsupportedAccess = 0x0601_0000,
    /// Attempt to read a write only object
    WriteOnly = 0x0601_0001,
    /// Attempt to write a read only object
    ReadOnly = 0x0601_0002,
    /// Object does not exist in the dictionary
    NoSuchObject = 0x0602_0000,
    /// Object cannot be mapped to the PDO
    UnmappablePdo = 0x0604_0041,
    /// The number and length of objects would exceed PDO length
    PdoTooLong = 0x0604_0042,
    /// General parameter incompatibility
    IncompatibleParameter = 0x0604_0043,
    /// Access failed due to hardware error
    HardwareError = 0x0606_0000,
    /// Data type does not match, length of service parameter does not match
    DataTypeMismatch = 0x0607_0010,
    /// Data type does not match, length of service parameter too high
    DataTypeMismatchLengthHigh = 0x0607_0012,
    /// Data type does not match, length of service parameter too low
    DataTypeMismatchLengthLow = 0x0607_0013,
    /// Sub-index does not exist
    NoSuchSubIndex = 0x0609_0011,
    /// Invalid value for parameter (download only)
    InvalidValue = 0x0609_0030,
    /// General error
    GeneralError = 0x0800_0000,
    /// Data cannot be transferred or stored to the application
    CantStore = 0x0800_0020,
    /// No data available
    NoData = 0x0800_0024,
}

/// An SDO request, sent from the master's client to a node's server
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SdoRequest {
    /// Begin a download, writing data to an object on the server
    InitiateDownload {
        /// Number of unused bytes in `data` (meaningful when e=1, s=1)
        n: u8,
        /// Expedited flag
        e: bool,
        /// Size-indicated flag
        s: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Inline value (expedited) or total byte count (segmented, s=1)
        data: [u8; 4],
    },
    /// One segment of a segmented download
    DownloadSegment {
        /// Toggle flag, alternating per segment starting at 0
        t: bool,
        /// Number of unused bytes in `data`
        n: u8,
        /// Set on the final segment
        c: bool,
        /// Segment payload
        data: [u8; 7],
    },
    /// Begin an upload of an object from the server
    InitiateUpload {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
    },
    /// Request the next segment of a segmented upload
    UploadSegment {
        /// Toggle flag, alternating per segment starting at 0
        t: bool,
    },
    /// Abort the transaction in progress
    Abort {
        /// Object index of the active transaction
        index: u16,
        /// Object sub-index of the active transaction
        sub: u8,
        /// The abort reason
        abort_code: u32,
    },
}

impl SdoRequest {
    /// Create an expedited download carrying 1..=4 inline bytes
    pub fn expedited_download(index: u16, sub: u8, data: &[u8]) -> Self {
        assert!(data.len() <= 4, "expedited download carries at most 4 bytes");
        let mut inline = [0u8; 4];
        inline[0..data.len()].copy_from_slice(data);
        SdoRequest::InitiateDownload {
            n: (4 - data.len()) as u8,
            e: true,
            s: true,
            index,
            sub,
            data: inline,
        }
    }

    /// Create a segmented download initiation announcing `size` total bytes
    pub fn initiate_download(index: u16, sub: u8, size: u32) -> Self {
        SdoRequest::InitiateDownload {
            n: 0,
            e: false,
            s: true,
            index,
            sub,
            data: size.to_le_bytes(),
        }
    }

    /// Create one download segment
    pub fn download_segment(toggle: bool, last_segment: bool, segment: &[u8]) -> Self {
        assert!(segment.len() <= 7, "segment carries at most 7 bytes");
        let mut data = [0u8; 7];
        data[0..segment.len()].copy_from_slice(segment);
        SdoRequest::DownloadSegment {
            t: toggle,
            n: (7 - segment.len()) as u8,
            c: last_segment,
            data,
        }
    }

    /// Create an upload initiation
    pub fn initiate_upload(index: u16, sub: u8) -> Self {
        SdoRequest::InitiateUpload { index, sub }
    }

    /// Create an upload segment request
    pub fn upload_segment(toggle: bool) -> Self {
        SdoRequest::UploadSegment { t: toggle }
    }

    /// Create an abort request
    pub fn abort(index: u16, sub: u8, abort_code: AbortCode) -> Self {
        SdoRequest::Abort {
            index,
            sub,
            abort_code: abort_code as u32,
        }
    }

    /// Serialize the request into a CAN frame with the given COB-ID
    pub fn to_frame(self, id: CanId) -> CanFrame {
        let mut payload = [0u8; 8];
        match self {
            SdoRequest::InitiateDownload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                payload[0] = ((ClientCommand::InitiateDownload as u8) << 5)
                    | ((n & 0x3) << 2)
                    | ((e as u8) << 1)
                    | s as u8;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&data);
            }
            SdoRequest::DownloadSegment { t, n, c, data } => {
                payload[0] = ((ClientCommand::DownloadSegment as u8) << 5)
                    | ((t as u8) << 4)
                    | ((n & 0x7) << 1)
                    | c as u8;
                payload[1..8].copy_from_slice(&data);
            }
            SdoRequest::InitiateUpload { index, sub } => {
                payload[0] = (ClientCommand::InitiateUpload as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
            }
            SdoRequest::UploadSegment { t } => {
                payload[0] = ((ClientCommand::UploadSegment as u8) << 5) | ((t as u8) << 4);
            }
            SdoRequest::Abort {
                index,
                sub,
                abort_code,
            } => {
                payload[0] = (ClientCommand::Abort as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&abort_code.to_le_bytes());
            }
        }
        CanFrame::new(id, &payload)
    }
}

impl TryFrom<&[u8]> for SdoRequest {
    type Error = AbortCode;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() < 8 {
            return Err(AbortCode::DataTypeMismatchLengthLow);
        }
        let ccs: ClientCommand = (value[0] >> 5)
            .try_into()
            .map_err(|_| AbortCode::InvalidCommandSpecifier)?;

        match ccs {
            ClientCommand::DownloadSegment => Ok(SdoRequest::DownloadSegment {
                t: (value[0] & (1 << 4)) != 0,
                n: (value[0] >> 1) & 0x7,
                c: (value[0] & 1) != 0,
                data: value[1..8].try_into().unwrap(),
            }),
            ClientCommand::InitiateDownload => Ok(SdoRequest::InitiateDownload {
                n: (value[0] >> 2) & 0x3,
                e: (value[0] & (1 << 1)) != 0,
                s: (value[0] & 1) != 0,
                index: u16::from_le_bytes([value[1], value[2]]),
                sub: value[3],
                data: value[4..8].try_into().unwrap(),
            }),
            ClientCommand::InitiateUpload => Ok(SdoRequest::InitiateUpload {
                index: u16::from_le_bytes([value[1], value[2]]),
                sub: value[3],
            }),
            ClientCommand::UploadSegment => Ok(SdoRequest::UploadSegment {
                t: (value[0] & (1 << 4)) != 0,
            }),
            ClientCommand::Abort => Ok(SdoRequest::Abort {
                index: u16::from_le_bytes([value[1], value[2]]),
                sub: value[3],
                abort_code: u32::from_le_bytes(value[4..8].try_into().unwrap()),
            }),
        }
    }
}

/// An SDO response, sent from a node's server back to the master's client
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SdoResponse {
    /// Response to an [`SdoRequest::InitiateUpload`]
    ConfirmUpload {
        /// Number of unused bytes in `data` (meaningful when e=1, s=1)
        n: u8,
        /// Expedited flag
        e: bool,
        /// Size-indicated flag
        s: bool,
        /// Object index being uploaded
        index: u16,
        /// Object sub-index being uploaded
        sub: u8,
        /// Inline value (expedited) or total byte count (segmented, s=1)
        data: [u8; 4],
    },
    /// One segment of a segmented upload
    UploadSegment {
        /// Toggle flag
        t: bool,
        /// Number of unused bytes in `data`
        n: u8,
        /// Set on the final segment
        c: bool,
        /// Segment payload
        data: [u8; 7],
    },
    /// Response to an [`SdoRequest::InitiateDownload`]
    ConfirmDownload {
        /// Object index being written
        index: u16,
        /// Object sub-index being written
        sub: u8,
    },
    /// Response to an [`SdoRequest::DownloadSegment`]
    ConfirmDownloadSegment {
        /// Toggle flag echoed from the segment
        t: bool,
    },
    /// Abort of the transaction in progress
    Abort {
        /// Object index of the active transaction
        index: u16,
        /// Object sub-index of the active transaction
        sub: u8,
        /// The abort reason
        abort_code: u32,
    },
}

impl SdoResponse {
    /// Create a `ConfirmUpload` for an expedited upload of 1..=4 bytes
    pub fn expedited_upload(index: u16, sub: u8, data: &[u8]) -> Self {
        assert!(
            !data.is_empty() && data.len() <= 4,
            "expedited upload carries 1..=4 bytes"
        );
        let mut inline = [0u8; 4];
        inline[0..data.len()].copy_from_slice(data);
        SdoResponse::ConfirmUpload {
            n: (4 - data.len()) as u8,
            e: true,
            s: true,
            index,
            sub,
            data: inline,
        }
    }

    /// Create a `ConfirmUpload` announcing a segmented upload of `size` bytes
    pub fn upload_acknowledge(index: u16, sub: u8, size: u32) -> Self {
        SdoResponse::ConfirmUpload {
            n: 0,
            e: false,
            s: true,
            index,
            sub,
            data: size.to_le_bytes(),
        }
    }

    /// Create one upload segment
    pub fn upload_segment(t: bool, c: bool, segment: &[u8]) -> Self {
        assert!(segment.len() <= 7, "segment carries at most 7 bytes");
        let mut data = [0u8; 7];
        data[0..segment.len()].copy_from_slice(segment);
        SdoResponse::UploadSegment {
            t,
            n: (7 - segment.len()) as u8,
            c,
            data,
        }
    }

    /// Create a `ConfirmDownload`
    pub fn download_acknowledge(index: u16, sub: u8) -> Self {
        SdoResponse::ConfirmDownload { index, sub }
    }

    /// Create a `ConfirmDownloadSegment`
    pub fn download_segment_acknowledge(t: bool) -> Self {
        SdoResponse::ConfirmDownloadSegment { t }
    }

    /// Create an abort response
    pub fn abort(index: u16, sub: u8, abort_code: AbortCode) -> Self {
        SdoResponse::Abort {
            index,
            sub,
            abort_code: abort_code as u32,
        }
    }

    /// Serialize the response into a CAN frame with the given COB-ID
    pub fn to_frame(self, id: CanId) -> CanFrame {
        let mut payload = [0u8; 8];
        match self {
            SdoResponse::ConfirmUpload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                payload[0] = ((ServerCommand::Upload as u8) << 5)
                    | ((n & 0x3) << 2)
                    | ((e as u8) << 1)
                    | s as u8;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&data);
            }
            SdoResponse::UploadSegment { t, n, c, data } => {
                payload[0] = ((ServerCommand::UploadSegment as u8) << 5)
                    | ((t as u8) << 4)
                    | ((n & 0x7) << 1)
                    | c as u8;
                payload[1..8].copy_from_slice(&data);
            }
            SdoResponse::ConfirmDownload { index, sub } => {
                payload[0] = (ServerCommand::Download as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
            }
            SdoResponse::ConfirmDownloadSegment { t } => {
                payload[0] = ((ServerCommand::DownloadSegment as u8) << 5) | ((t as u8) << 4);
            }
            SdoResponse::Abort {
                index,
                sub,
                abort_code,
            } => {
                payload[0] = (ServerCommand::Abort as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&abort_code.to_le_bytes());
            }
        }
        CanFrame::new(id, &payload)
    }
}

impl TryFrom<&CanFrame> for SdoResponse {
    type Error = ();

    fn try_from(frame: &CanFrame) -> Result<Self, Self::Error> {
        if frame.dlc < 8 {
            return Err(());
        }
        let scs: ServerCommand = (frame.data[0] >> 5).try_into()?;
        match scs {
            ServerCommand::UploadSegment => Ok(SdoResponse::UploadSegment {
                t: (frame.data[0] & (1 << 4)) != 0,
                n: (frame.data[0] >> 1) & 0x7,
                c: (frame.data[0] & 1) != 0,
                data: frame.data[1..8].try_into().unwrap(),
            }),
            ServerCommand::DownloadSegment => Ok(SdoResponse::ConfirmDownloadSegment {
                t: (frame.data[0] & (1 << 4)) != 0,
            }),
            ServerCommand::Upload => Ok(SdoResponse::ConfirmUpload {
                n: (frame.data[0] >> 2) & 0x3,
                e: (frame.data[0] & (1 << 1)) != 0,
                s: (frame.data[0] & 1) != 0,
                index: u16::from_le_bytes([frame.data[1], frame.data[2]]),
                sub: frame.data[3],
                data: frame.data[4..8].try_into().unwrap(),
            }),
            ServerCommand::Download => Ok(SdoResponse::ConfirmDownload {
                index: u16::from_le_bytes([frame.data[1], frame.data[2]]),
                sub: frame.data[3],
            }),
            ServerCommand::Abort => Ok(SdoResponse::Abort {
                index: u16::from_le_bytes([frame.data[1], frame.data[2]]),
                sub: frame.data[3],
                abort_code: u32::from_le_bytes(frame.data[4..8].try_into().unwrap()),
            }),
        }
    }
}
