//! Report framing for the signing device link.
//!
//! Requests and responses travel in 64-byte reports: a big-endian channel
//! word, a tag byte and a big-endian sequence number, with the first report
//! of a message also carrying the total payload length. Responses end with
//! a two-byte status word; anything but `0x9000` aborts the operation.

use crate::error::{Error, Result};

pub const CHANNEL: u16 = 0x0101;
pub const TAG: u8 = 0x05;
pub const REPORT_SIZE: usize = 64;
pub const STATUS_OK: u16 = 0x9000;

/// Byte-level exchange with the signing device: one framed request, one
/// framed response with the status word already checked and stripped.
pub trait SignerTransport {
    fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>>;
}

/// Raw report I/O, implemented by the external HID layer.
pub trait HidDevice {
    fn write(&mut self, report: &[u8; REPORT_SIZE]) -> Result<()>;
    fn read(&mut self, report: &mut [u8; REPORT_SIZE]) -> Result<usize>;
}

/// Split a payload into framed 64-byte reports.
pub fn frame_request(payload: &[u8]) -> Vec<[u8; REPORT_SIZE]> {
    let mut reports = Vec::new();
    let mut remaining = payload;
    let mut seq: u16 = 0;
    while !remaining.is_empty() || seq == 0 {
        let mut report = [0u8; REPORT_SIZE];
        report[..2].copy_from_slice(&CHANNEL.to_be_bytes());
        report[2] = TAG;
        report[3..5].copy_from_slice(&seq.to_be_bytes());
        let data_start = if seq == 0 {
            report[5..7].copy_from_slice(&(payload.len() as u16).to_be_bytes());
            7
        } else {
            5
        };
        let n = remaining.len().min(REPORT_SIZE - data_start);
        report[data_start..data_start + n].copy_from_slice(&remaining[..n]);
        remaining = &remaining[n..];
        reports.push(report);
        seq += 1;
    }
    reports
}

/// Transport running the report codec over a raw HID device.
pub struct HidTransport<D: HidDevice> {
    device: D,
}

impl<D: HidDevice> HidTransport<D> {
    pub fn new(device: D) -> HidTransport<D> {
        HidTransport { device }
    }
}

impl<D: HidDevice> SignerTransport for HidTransport<D> {
    fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        for report in frame_request(request) {
            self.device.write(&report)?;
        }

        let mut response = Vec::new();
        let mut expected: usize = 0;
        let mut seq: u16 = 0;
        loop {
            let mut report = [0u8; REPORT_SIZE];
            let n = self.device.read(&mut report)?;
            if n < REPORT_SIZE {
                return Err(Error::DeviceRead);
            }
            if u16::from_be_bytes([report[0], report[1]]) != CHANNEL
                || report[2] != TAG
                || u16::from_be_bytes([report[3], report[4]]) != seq
            {
                return Err(Error::DeviceRead);
            }
            let body = if seq == 0 {
                expected = u16::from_be_bytes([report[5], report[6]]) as usize;
                &report[7..]
            } else {
                &report[5..]
            };
            let take = body.len().min(expected - response.len());
            response.extend_from_slice(&body[..take]);
            seq += 1;
            if response.len() == expected {
                break;
            }
        }

        if response.len() < 2 {
            return Err(Error::DeviceRead);
        }
        let sw = u16::from_be_bytes([response[response.len() - 2], response[response.len() - 1]]);
        if sw != STATUS_OK {
            return Err(Error::InvalidStatus(sw));
        }
        response.truncate(response.len() - 2);
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// A fake device that deframes writes and frames a canned response.
    struct LoopDevice {
        received: Vec<u8>,
        reply: VecDeque<[u8; REPORT_SIZE]>,
        response: Vec<u8>,
    }

    impl LoopDevice {
        fn new(response: Vec<u8>) -> LoopDevice {
            LoopDevice {
                received: Vec::new(),
                reply: VecDeque::new(),
                response,
            }
        }
    }

    impl HidDevice for LoopDevice {
        fn write(&mut self, report: &[u8; REPORT_SIZE]) -> Result<()> {
            let seq = u16::from_be_bytes([report[3], report[4]]);
            let body = if seq == 0 { &report[7..] } else { &report[5..] };
            self.received.extend_from_slice(body);
            Ok(())
        }

        fn read(&mut self, report: &mut [u8; REPORT_SIZE]) -> Result<usize> {
            if self.reply.is_empty() {
                for framed in frame_request(&self.response) {
                    self.reply.push_back(framed);
                }
            }
            let next = self.reply.pop_front().ok_or(Error::DeviceRead)?;
            report.copy_from_slice(&next);
            Ok(REPORT_SIZE)
        }
    }

    #[test]
    fn frame_layout_is_stable() {
        let reports = frame_request(&[0xAA; 10]);
        assert_eq!(reports.len(), 1);
        let r = reports[0];
        assert_eq!(&r[..2], &CHANNEL.to_be_bytes());
        assert_eq!(r[2], TAG);
        assert_eq!(&r[3..5], &[0, 0]);
        assert_eq!(&r[5..7], &10u16.to_be_bytes());
        assert_eq!(&r[7..17], &[0xAA; 10]);
        assert_eq!(&r[17..], &[0u8; 47]);
    }

    #[test]
    fn long_payloads_span_reports() {
        let payload: Vec<u8> = (0..200u8).collect();
        let reports = frame_request(&payload);
        // 57 bytes fit in the first report, 59 in each later one.
        assert_eq!(reports.len(), 1 + (200usize - 57).div_ceil(59));
        assert_eq!(u16::from_be_bytes([reports[1][3], reports[1][4]]), 1);
    }

    #[test]
    fn exchange_roundtrip_strips_status() {
        let mut response = vec![1, 2, 3];
        response.extend_from_slice(&STATUS_OK.to_be_bytes());
        let mut transport = HidTransport::new(LoopDevice::new(response));
        let out = transport.exchange(&[0xEB, 0x05, 0, 0, 0]).unwrap();
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[test]
    fn bad_status_word_is_fatal() {
        let response = vec![0x69, 0x85];
        let mut transport = HidTransport::new(LoopDevice::new(response));
        let err = transport.exchange(&[0xEB, 0x05, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, Error::InvalidStatus(0x6985)));
    }
}
