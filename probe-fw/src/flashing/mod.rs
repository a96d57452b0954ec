//! The flash programming framework.
//!
//! A [`FlashBank`] pairs the geometry of a flash region with the family
//! driver that knows its register-level procedure. The framework owns
//! everything the families have in common: the erase alignment contract,
//! widening unaligned writes to the region's programming alignment with
//! erased-byte padding, coalescing consecutive writes into buffered
//! chunks, and read-back verification. Drivers only see aligned spans.

pub mod stub;

use probe_fw_target::NvmProperties;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::architecture::arm::core::CortexM;
use crate::architecture::arm::dp::DpAccess;
use crate::architecture::arm::ArmError;

/// Flash programming errors.
#[derive(thiserror::Error, Debug)]
pub enum FlashError {
    /// The status register reports a write protection error.
    #[error("The flash controller reports a protection error")]
    Protected,
    /// The flash controller did not finish within its time budget.
    #[error("Timed out waiting for the flash controller")]
    Timeout,
    /// An erase did not complete successfully.
    #[error("Erase failed at {address:#010x}")]
    EraseFailed {
        /// Block address.
        address: u32,
    },
    /// A program operation did not complete successfully.
    #[error("Programming failed at {address:#010x}")]
    ProgramFailed {
        /// Write address.
        address: u32,
    },
    /// Erase calls must cover whole blocks.
    #[error(
        "Erase range {address:#010x}+{length:#x} is not a multiple of the {block_size:#x} block size"
    )]
    EraseAlignment {
        /// Requested start.
        address: u32,
        /// Requested length.
        length: u32,
        /// The region's block size.
        block_size: u32,
    },
    /// The requested range is not inside the region.
    #[error("Range {address:#010x}+{length:#x} is outside the flash region")]
    OutOfRegion {
        /// Requested start.
        address: u32,
        /// Requested length.
        length: u32,
    },
    /// Read-back after programming did not match.
    #[error("Verification mismatch at {address:#010x}")]
    Verify {
        /// First mismatching address.
        address: u32,
    },
    /// The stub blob did not load intact into target RAM.
    #[error("Flash stub failed to load into target RAM")]
    StubLoad,
    /// An on-target routine returned a failure status.
    #[error("Flash stub signalled an error: {0:#010x}")]
    Stub(u32),
    /// The operation is not implemented for this family.
    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),
    /// A debug interface error occurred underneath.
    #[error(transparent)]
    Arm(#[from] ArmError),
}

/// Core and wire access handed to flash drivers.
pub struct FlashAccess<'a> {
    /// The halted core the flash hangs off.
    pub core: &'a mut CortexM,
    /// The debug port.
    pub dp: &'a mut dyn DpAccess,
}

impl FlashAccess<'_> {
    /// Read a 32-bit peripheral register or memory word.
    pub fn read_word_32(&mut self, address: u32) -> Result<u32, ArmError> {
        self.core.ap_mut().read_word_32(self.dp, address)
    }

    /// Write a 32-bit peripheral register or memory word.
    pub fn write_word_32(&mut self, address: u32, value: u32) -> Result<(), ArmError> {
        self.core.ap_mut().write_word_32(self.dp, address, value)
    }

    /// Write a 16-bit value; some families program half words.
    pub fn write_word_16(&mut self, address: u32, value: u16) -> Result<(), ArmError> {
        self.core.ap_mut().write_word_16(self.dp, address, value)
    }

    /// Read a byte buffer.
    pub fn read_8(&mut self, address: u32, data: &mut [u8]) -> Result<(), ArmError> {
        self.core.ap_mut().read_8(self.dp, address, data)
    }

    /// Write a byte buffer.
    pub fn write_8(&mut self, address: u32, data: &[u8]) -> Result<(), ArmError> {
        self.core.ap_mut().write_8(self.dp, address, data)
    }

    /// Write a word buffer.
    pub fn write_32(&mut self, address: u32, data: &[u32]) -> Result<(), ArmError> {
        self.core.ap_mut().write_32(self.dp, address, data)
    }

    /// Busy-poll a status register until the busy mask clears.
    ///
    /// Returns the final register value. The poll is bounded both by a
    /// generous iteration watchdog and the millisecond budget.
    pub fn poll_status(
        &mut self,
        address: u32,
        busy_mask: u32,
        timeout: Duration,
    ) -> Result<u32, FlashError> {
        let start = Instant::now();
        let mut polls = 0u32;

        loop {
            let status = self.read_word_32(address)?;
            if status & busy_mask == 0 {
                trace!("Status {address:#010x} settled after {polls} polls: {status:#010x}");
                return Ok(status);
            }
            polls += 1;
            if polls >= 1000 && start.elapsed() >= timeout {
                return Err(FlashError::Timeout);
            }
        }
    }

    /// Compare flash contents against `expected`.
    pub fn verify(&mut self, address: u32, expected: &[u8]) -> Result<(), FlashError> {
        let mut read_back = vec![0u8; expected.len()];
        self.read_8(address, &mut read_back)?;

        for (offset, (got, want)) in read_back.iter().zip(expected).enumerate() {
            if got != want {
                return Err(FlashError::Verify {
                    address: address + offset as u32,
                });
            }
        }
        Ok(())
    }
}

/// The register-level procedure of one flash family.
///
/// The framework guarantees that `erase_block` receives block-aligned
/// addresses inside the region and that `program` receives spans aligned
/// to the region's write alignment (and chunk-aligned for buffered
/// regions), already padded with the erased byte value.
pub trait FlashDriver {
    /// Erase the block starting at `address`.
    fn erase_block(
        &mut self,
        access: &mut FlashAccess<'_>,
        props: &NvmProperties,
        address: u32,
    ) -> Result<(), FlashError>;

    /// Program an aligned, padded span.
    fn program(
        &mut self,
        access: &mut FlashAccess<'_>,
        props: &NvmProperties,
        address: u32,
        data: &[u8],
    ) -> Result<(), FlashError>;

    /// Lock the flash and clear status; the last call of an operation
    /// batch.
    fn done(
        &mut self,
        access: &mut FlashAccess<'_>,
        props: &NvmProperties,
    ) -> Result<(), FlashError> {
        let _ = (access, props);
        Ok(())
    }

    /// Erase the entire device, where the family has a faster path than
    /// block-by-block.
    fn erase_all(
        &mut self,
        access: &mut FlashAccess<'_>,
        props: &NvmProperties,
    ) -> Result<(), FlashError> {
        let _ = (access, props);
        Err(FlashError::NotImplemented("mass erase"))
    }
}

/// A committed span waiting in the coalescing buffer.
#[derive(Debug)]
struct Pending {
    address: u32,
    data: Vec<u8>,
}

impl Pending {
    fn end(&self) -> u32 {
        self.address + self.data.len() as u32
    }
}

/// Writes to unbuffered regions are still batched, committed in spans of
/// up to this size.
const UNBUFFERED_COMMIT: usize = 4096;

/// One flash region plus the driver programming it.
pub struct FlashBank {
    /// The region's geometry and programming properties.
    pub props: NvmProperties,
    /// The family driver.
    pub driver: Box<dyn FlashDriver>,
    pending: Option<Pending>,
}

impl FlashBank {
    /// Pair a region with its driver.
    pub fn new(props: NvmProperties, driver: Box<dyn FlashDriver>) -> Self {
        FlashBank {
            props,
            driver,
            pending: None,
        }
    }

    /// Whether `address` falls inside this bank.
    pub fn contains(&self, address: u32) -> bool {
        self.props.address_range.contains(&address)
    }

    /// The chunk granule writes are committed in.
    fn commit_unit(&self) -> usize {
        self.props
            .write_buffer_size
            .map(|size| size as usize)
            .unwrap_or(UNBUFFERED_COMMIT)
    }

    /// Erase `[address, address + length)`.
    ///
    /// Both bounds must be multiples of the block size; the whole range
    /// must lie inside the region.
    pub fn erase(
        &mut self,
        access: &mut FlashAccess<'_>,
        address: u32,
        length: u32,
    ) -> Result<(), FlashError> {
        let block_size = self.props.block_size;
        if address % block_size != 0 || length % block_size != 0 {
            return Err(FlashError::EraseAlignment {
                address,
                length,
                block_size,
            });
        }
        self.check_range(address, length)?;

        debug!(
            "Erasing {length:#x} bytes at {address:#010x} in {block_size:#x} blocks"
        );
        for block in (address..address + length).step_by(block_size as usize) {
            self.driver.erase_block(access, &self.props, block)?;
        }
        Ok(())
    }

    /// Buffer a write of `data` to `address`.
    ///
    /// The span may be arbitrarily aligned; the framework widens it to
    /// the programming alignment, padding with the erased byte value,
    /// and commits full chunks as they fill. Unwritten ranges are never
    /// touched beyond that padding, which is a no-op on erased cells.
    pub fn write(
        &mut self,
        access: &mut FlashAccess<'_>,
        address: u32,
        data: &[u8],
    ) -> Result<(), FlashError> {
        self.check_range(address, data.len() as u32)?;

        // A non-contiguous write ends the current run.
        if let Some(pending) = &self.pending {
            if pending.end() != address {
                self.flush(access)?;
            }
        }

        if self.pending.is_none() {
            // Buffered regions commit whole chunks, so the run starts on
            // a chunk boundary; plain regions only need the programming
            // alignment.
            let align = match self.props.write_buffer_size {
                Some(size) => size,
                None => self.props.write_alignment,
            };
            let start = address - address % align;
            let mut run = Pending {
                address: start,
                data: Vec::with_capacity(self.commit_unit()),
            };
            run.data
                .resize((address - start) as usize, self.props.erased_byte_value);
            self.pending = Some(run);
        }

        let pending = self.pending.as_mut().expect("run was just created");
        pending.data.extend_from_slice(data);

        self.commit_full_chunks(access)
    }

    /// Flush whatever is buffered and let the driver lock up.
    pub fn done(&mut self, access: &mut FlashAccess<'_>) -> Result<(), FlashError> {
        self.flush(access)?;
        self.driver.done(access, &self.props)
    }

    /// The family's whole-device erase.
    pub fn erase_all(&mut self, access: &mut FlashAccess<'_>) -> Result<(), FlashError> {
        self.pending = None;
        self.driver.erase_all(access, &self.props)
    }

    fn check_range(&self, address: u32, length: u32) -> Result<(), FlashError> {
        let in_region = address >= self.props.address_range.start
            && address + length <= self.props.address_range.end;
        if !in_region {
            return Err(FlashError::OutOfRegion { address, length });
        }
        Ok(())
    }

    /// Commit every full chunk at the head of the run.
    fn commit_full_chunks(&mut self, access: &mut FlashAccess<'_>) -> Result<(), FlashError> {
        let unit = self.commit_unit();

        while self
            .pending
            .as_ref()
            .map(|p| p.data.len() >= unit)
            .unwrap_or(false)
        {
            let pending = self.pending.as_mut().expect("checked above");
            let chunk: Vec<u8> = pending.data.drain(..unit).collect();
            let chunk_address = pending.address;
            pending.address += unit as u32;

            self.driver
                .program(access, &self.props, chunk_address, &chunk)?;

            if self.pending.as_ref().map(|p| p.data.is_empty()).unwrap_or(false) {
                self.pending = None;
            }
        }
        Ok(())
    }

    /// Commit the remainder of the run, padded out to the programming
    /// granule.
    fn flush(&mut self, access: &mut FlashAccess<'_>) -> Result<(), FlashError> {
        let Some(mut pending) = self.pending.take() else {
            return Ok(());
        };
        if pending.data.is_empty() {
            return Ok(());
        }

        let granule = match self.props.write_buffer_size {
            Some(size) => size as usize,
            None => self.props.write_alignment as usize,
        };
        let padded = pending.data.len().div_ceil(granule) * granule;
        pending
            .data
            .resize(padded, self.props.erased_byte_value);

        self.driver
            .program(access, &self.props, pending.address, &pending.data)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::architecture::arm::ap::mock::MockDap;
    use crate::architecture::arm::ap::{GenericAp, MemoryAp, IDR};
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[derive(Default)]
    struct DriverLog {
        programs: Vec<(u32, usize)>,
        erases: Vec<u32>,
    }

    /// A driver that programs straight into the mock's RAM-backed flash
    /// and records every span it was handed.
    struct RecordingDriver {
        log: Rc<RefCell<DriverLog>>,
    }

    impl FlashDriver for RecordingDriver {
        fn erase_block(
            &mut self,
            access: &mut FlashAccess<'_>,
            props: &NvmProperties,
            address: u32,
        ) -> Result<(), FlashError> {
            self.log.borrow_mut().erases.push(address);
            let erased = vec![props.erased_byte_value; props.block_size as usize];
            access.write_8(address, &erased)?;
            Ok(())
        }

        fn program(
            &mut self,
            access: &mut FlashAccess<'_>,
            props: &NvmProperties,
            address: u32,
            data: &[u8],
        ) -> Result<(), FlashError> {
            assert_eq!(address % props.write_alignment, 0, "unaligned program");
            assert_eq!(data.len() % props.write_alignment as usize, 0);
            self.log.borrow_mut().programs.push((address, data.len()));
            access.write_8(address, data)?;
            Ok(())
        }
    }

    fn setup(props: NvmProperties) -> (MockDap, CortexM, FlashBank, Rc<RefCell<DriverLog>>) {
        // The mock's RAM doubles as the flash backing store.
        let mut dap = MockDap::new(props.address_range.start, 0x2000);
        let idr = IDR::from(dap.idr);
        let ap = MemoryAp::new(&mut dap, GenericAp { apsel: 0, idr }).unwrap();
        let mut core = CortexM::new(ap, Arc::new(AtomicBool::new(false)));
        core.attach(&mut dap).unwrap();

        let log = Rc::new(RefCell::new(DriverLog::default()));
        let bank = FlashBank::new(props, Box::new(RecordingDriver { log: log.clone() }));
        (dap, core, bank, log)
    }

    fn props_unbuffered() -> NvmProperties {
        NvmProperties {
            address_range: 0x0800_0000..0x0800_2000,
            block_size: 0x400,
            write_alignment: 4,
            erased_byte_value: 0xFF,
            write_buffer_size: None,
            erase_block_timeout: 100,
            program_timeout: 100,
        }
    }

    #[test]
    fn erase_enforces_block_alignment() {
        let (mut dap, mut core, mut bank, _log) = setup(props_unbuffered());
        let mut access = FlashAccess {
            core: &mut core,
            dp: &mut dap,
        };

        assert!(matches!(
            bank.erase(&mut access, 0x0800_0100, 0x400),
            Err(FlashError::EraseAlignment { .. })
        ));
        assert!(matches!(
            bank.erase(&mut access, 0x0800_0000, 0x3FF),
            Err(FlashError::EraseAlignment { .. })
        ));
        assert!(matches!(
            bank.erase(&mut access, 0x0800_1C00, 0x800),
            Err(FlashError::OutOfRegion { .. })
        ));

        bank.erase(&mut access, 0x0800_0000, 0x800).unwrap();
    }

    #[test]
    fn erase_iterates_blocks_and_leaves_erased_bytes() {
        let (mut dap, mut core, mut bank, log) = setup(props_unbuffered());
        let mut access = FlashAccess {
            core: &mut core,
            dp: &mut dap,
        };

        bank.erase(&mut access, 0x0800_0400, 0x800).unwrap();

        assert_eq!(log.borrow().erases, vec![0x0800_0400, 0x0800_0800]);

        let mut data = vec![0u8; 0x800];
        access.read_8(0x0800_0400, &mut data).unwrap();
        assert!(data.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn unaligned_write_is_widened_and_padded() {
        // 100 bytes at +3 with alignment 4 become one 104-byte aligned
        // span padded with 0xFF.
        let (mut dap, mut core, mut bank, log) = setup(props_unbuffered());
        let mut access = FlashAccess {
            core: &mut core,
            dp: &mut dap,
        };

        bank.erase(&mut access, 0x0800_0000, 0x400).unwrap();

        let payload: Vec<u8> = (0..100).collect();
        bank.write(&mut access, 0x0800_0003, &payload).unwrap();
        bank.done(&mut access).unwrap();

        assert_eq!(log.borrow().programs, vec![(0x0800_0000, 104)]);

        let mut read_back = vec![0u8; 104];
        access.read_8(0x0800_0000, &mut read_back).unwrap();
        assert_eq!(&read_back[..3], &[0xFF, 0xFF, 0xFF]);
        assert_eq!(&read_back[3..103], &payload[..]);
        assert_eq!(read_back[103], 0xFF);
    }

    #[test]
    fn buffered_writes_commit_on_chunk_boundaries_only() {
        let mut props = props_unbuffered();
        props.write_buffer_size = Some(64);
        let (mut dap, mut core, mut bank, log) = setup(props);
        let mut access = FlashAccess {
            core: &mut core,
            dp: &mut dap,
        };

        // 40 bytes: nothing committed yet.
        bank.write(&mut access, 0x0800_0000, &[0xAA; 40]).unwrap();
        assert!(log.borrow().programs.is_empty());

        // 40 more: one full chunk commits, 16 bytes stay pending.
        bank.write(&mut access, 0x0800_0028, &[0xBB; 40]).unwrap();
        assert_eq!(log.borrow().programs, vec![(0x0800_0000, 64)]);

        // done() flushes the padded remainder as a whole chunk.
        bank.done(&mut access).unwrap();
        assert_eq!(
            log.borrow().programs,
            vec![(0x0800_0000, 64), (0x0800_0040, 64)]
        );
    }

    #[test]
    fn discontiguous_write_flushes_the_run() {
        let mut props = props_unbuffered();
        props.write_buffer_size = Some(64);
        let (mut dap, mut core, mut bank, log) = setup(props);
        let mut access = FlashAccess {
            core: &mut core,
            dp: &mut dap,
        };

        bank.write(&mut access, 0x0800_0000, &[0x11; 8]).unwrap();
        bank.write(&mut access, 0x0800_0100, &[0x22; 8]).unwrap();
        bank.done(&mut access).unwrap();

        assert_eq!(
            log.borrow().programs,
            vec![(0x0800_0000, 64), (0x0800_0100, 64)]
        );
    }

    #[test]
    fn erase_write_read_roundtrip() {
        let (mut dap, mut core, mut bank, _log) = setup(props_unbuffered());
        let mut access = FlashAccess {
            core: &mut core,
            dp: &mut dap,
        };

        bank.erase(&mut access, 0x0800_0000, 0x400).unwrap();
        let payload: Vec<u8> = (0..=255).cycle().take(256).collect();
        bank.write(&mut access, 0x0800_0080, &payload).unwrap();
        bank.done(&mut access).unwrap();

        access.verify(0x0800_0080, &payload).unwrap();
        // Outside the written range the block still reads erased.
        access.verify(0x0800_0000, &[0xFF; 0x80]).unwrap();
        assert!(matches!(
            access.verify(0x0800_0081, &payload),
            Err(FlashError::Verify { address }) if address == 0x0800_0081
        ));
    }
}
