//! The memory access engine on top of a MEM-AP.
//!
//! Three AP registers do all the work: CSW selects the transfer size and
//! auto-increment mode, TAR holds the bus address and DRW moves the data,
//! incrementing TAR on every access. The engine caches the last CSW and
//! TAR values it programmed and elides writes that would not change them.

use bitfield::bitfield;
use scroll::{Pread, Pwrite, LE};

use super::{ApClass, GenericAp};
use crate::architecture::arm::dp::DpAccess;
use crate::architecture::arm::{ArmError, Register};

bitfield! {
    /// The control and status word of a MEM-AP.
    #[derive(Clone, Copy)]
    pub struct CSW(u32);
    impl Debug;
    pub dbg_sw_enable, set_dbg_sw_enable: 31;
    pub u8, prot, set_prot: 30, 24;
    pub spiden, _: 23;
    pub u8, mode, set_mode: 11, 8;
    pub tr_in_prog, _: 7;
    pub device_en, _: 6;
    pub u8, addr_inc, set_addr_inc: 5, 4;
    pub u8, size, set_size: 2, 0;
}

impl From<u32> for CSW {
    fn from(raw: u32) -> Self {
        CSW(raw)
    }
}

impl From<CSW> for u32 {
    fn from(raw: CSW) -> Self {
        raw.0
    }
}

impl Register for CSW {
    const ADDRESS: u8 = 0x00;
    const NAME: &'static str = "CSW";
}

/// The transfer address register.
#[derive(Debug, Clone, Copy)]
pub struct TAR(pub u32);

impl From<u32> for TAR {
    fn from(raw: u32) -> Self {
        TAR(raw)
    }
}

impl From<TAR> for u32 {
    fn from(raw: TAR) -> Self {
        raw.0
    }
}

impl Register for TAR {
    const ADDRESS: u8 = 0x04;
    const NAME: &'static str = "TAR";
}

/// The data read/write register.
#[derive(Debug, Clone, Copy)]
pub struct DRW(pub u32);

impl From<u32> for DRW {
    fn from(raw: u32) -> Self {
        DRW(raw)
    }
}

impl From<DRW> for u32 {
    fn from(raw: DRW) -> Self {
        raw.0
    }
}

impl Register for DRW {
    const ADDRESS: u8 = 0x0C;
    const NAME: &'static str = "DRW";
}

bitfield! {
    /// The debug base address register.
    #[derive(Clone, Copy)]
    pub struct BASE(u32);
    impl Debug;
    pub u32, baseaddr, _: 31, 12;
    pub format, _: 1;
    pub present, _: 0;
}

impl From<u32> for BASE {
    fn from(raw: u32) -> Self {
        BASE(raw)
    }
}

impl From<BASE> for u32 {
    fn from(raw: BASE) -> Self {
        raw.0
    }
}

impl Register for BASE {
    const ADDRESS: u8 = 0xF8;
    const NAME: &'static str = "BASE";
}

/// Transfer sizes in CSW.SIZE encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSize {
    /// 8-bit transfers.
    U8 = 0,
    /// 16-bit transfers.
    U16 = 1,
    /// 32-bit transfers.
    U32 = 2,
}

/// CSW.AddrInc single increment mode.
const ADDRINC_SINGLE: u8 = 0b01;

/// MEM-AP auto-increment is only architected within a 1 KiB span; bursts
/// split at this boundary and reprogram TAR.
const AUTOINC_SPAN: u32 = 0x400;

/// A MEM-AP with its cached transfer state.
#[derive(Debug)]
pub struct MemoryAp {
    apsel: u8,
    base: u32,
    csw_base: u32,
    cached_csw: Option<u32>,
    cached_tar: Option<u32>,
}

impl MemoryAp {
    /// Classify and prepare an enumerated AP for memory access.
    ///
    /// Reads BASE for the ROM table address and captures the reset value
    /// of CSW; its bus specific upper bits (prot, master type) are kept
    /// for every transfer the engine issues.
    pub fn new(dp: &mut dyn DpAccess, ap: GenericAp) -> Result<Self, ArmError> {
        if ap.idr.class() != Some(ApClass::MemAp) {
            return Err(ArmError::NotAMemoryAp(ap.apsel));
        }

        let base = BASE(dp.read_ap(ap.apsel, BASE::ADDRESS)?);
        let csw = dp.read_ap(ap.apsel, CSW::ADDRESS)?;

        // Keep the bus specific bits, clear size and increment which the
        // engine manages per transfer.
        let csw_base = csw & !0b0011_0111;

        Ok(MemoryAp {
            apsel: ap.apsel,
            base: base.baseaddr() << 12,
            csw_base,
            cached_csw: None,
            cached_tar: None,
        })
    }

    /// The AP's index in the DP SELECT register.
    pub fn apsel(&self) -> u8 {
        self.apsel
    }

    /// The ROM table base address announced in BASE.
    pub fn rom_table_base(&self) -> u32 {
        self.base
    }

    fn set_csw(&mut self, dp: &mut dyn DpAccess, size: DataSize) -> Result<(), ArmError> {
        let mut csw = CSW(self.csw_base);
        csw.set_addr_inc(ADDRINC_SINGLE);
        csw.set_size(size as u8);
        let value = u32::from(csw);

        if self.cached_csw != Some(value) {
            dp.write_ap(self.apsel, CSW::ADDRESS, value)?;
            self.cached_csw = Some(value);
        }
        Ok(())
    }

    fn set_tar(&mut self, dp: &mut dyn DpAccess, address: u32) -> Result<(), ArmError> {
        if self.cached_tar != Some(address) {
            dp.write_ap(self.apsel, TAR::ADDRESS, address)?;
            self.cached_tar = Some(address);
        }
        Ok(())
    }

    /// Account for the DRW auto-increment. Past a 1 KiB span the
    /// increment wraps in hardware, so the cache is invalidated there.
    fn advance_tar(&mut self, address: u32, bytes: u32) {
        let next = address.wrapping_add(bytes);
        self.cached_tar = if next % AUTOINC_SPAN == 0 {
            None
        } else {
            Some(next)
        };
    }

    /// Read a single 32-bit word.
    pub fn read_word_32(&mut self, dp: &mut dyn DpAccess, address: u32) -> Result<u32, ArmError> {
        check_alignment(address, 4)?;
        self.set_csw(dp, DataSize::U32)?;
        self.set_tar(dp, address)?;
        let value = dp.read_ap(self.apsel, DRW::ADDRESS)?;
        self.advance_tar(address, 4);
        Ok(value)
    }

    /// Write a single 32-bit word.
    pub fn write_word_32(
        &mut self,
        dp: &mut dyn DpAccess,
        address: u32,
        value: u32,
    ) -> Result<(), ArmError> {
        check_alignment(address, 4)?;
        self.set_csw(dp, DataSize::U32)?;
        self.set_tar(dp, address)?;
        dp.write_ap(self.apsel, DRW::ADDRESS, value)?;
        self.advance_tar(address, 4);
        Ok(())
    }

    /// Read a single 16-bit value from its byte lane.
    pub fn read_word_16(&mut self, dp: &mut dyn DpAccess, address: u32) -> Result<u16, ArmError> {
        check_alignment(address, 2)?;
        self.set_csw(dp, DataSize::U16)?;
        self.set_tar(dp, address)?;
        let value = dp.read_ap(self.apsel, DRW::ADDRESS)?;
        self.advance_tar(address, 2);
        Ok((value >> ((address & 0x2) * 8)) as u16)
    }

    /// Write a single 16-bit value into its byte lane.
    pub fn write_word_16(
        &mut self,
        dp: &mut dyn DpAccess,
        address: u32,
        value: u16,
    ) -> Result<(), ArmError> {
        check_alignment(address, 2)?;
        self.set_csw(dp, DataSize::U16)?;
        self.set_tar(dp, address)?;
        dp.write_ap(self.apsel, DRW::ADDRESS, u32::from(value) << ((address & 0x2) * 8))?;
        self.advance_tar(address, 2);
        Ok(())
    }

    /// Read a single byte from its lane.
    pub fn read_word_8(&mut self, dp: &mut dyn DpAccess, address: u32) -> Result<u8, ArmError> {
        self.set_csw(dp, DataSize::U8)?;
        self.set_tar(dp, address)?;
        let value = dp.read_ap(self.apsel, DRW::ADDRESS)?;
        self.advance_tar(address, 1);
        Ok((value >> ((address & 0x3) * 8)) as u8)
    }

    /// Write a single byte into its lane.
    pub fn write_word_8(
        &mut self,
        dp: &mut dyn DpAccess,
        address: u32,
        value: u8,
    ) -> Result<(), ArmError> {
        self.set_csw(dp, DataSize::U8)?;
        self.set_tar(dp, address)?;
        dp.write_ap(self.apsel, DRW::ADDRESS, u32::from(value) << ((address & 0x3) * 8))?;
        self.advance_tar(address, 1);
        Ok(())
    }

    /// Read a block of 32-bit words, pipelining DRW accesses and
    /// splitting the burst at every 1 KiB auto-increment span.
    pub fn read_32(
        &mut self,
        dp: &mut dyn DpAccess,
        address: u32,
        data: &mut [u32],
    ) -> Result<(), ArmError> {
        check_alignment(address, 4)?;
        if data.is_empty() {
            return Ok(());
        }

        self.set_csw(dp, DataSize::U32)?;

        let mut address = address;
        let mut remaining = data;
        while !remaining.is_empty() {
            let chunk_words = span_words(address, remaining.len());
            self.set_tar(dp, address)?;

            let (chunk, rest) = remaining.split_at_mut(chunk_words);
            dp.read_ap_repeated(self.apsel, DRW::ADDRESS, chunk)?;

            self.advance_tar(address, 4 * chunk_words as u32);
            address += 4 * chunk_words as u32;
            remaining = rest;
        }

        Ok(())
    }

    /// Write a block of 32-bit words.
    pub fn write_32(
        &mut self,
        dp: &mut dyn DpAccess,
        address: u32,
        data: &[u32],
    ) -> Result<(), ArmError> {
        check_alignment(address, 4)?;
        if data.is_empty() {
            return Ok(());
        }

        self.set_csw(dp, DataSize::U32)?;

        let mut address = address;
        let mut remaining = data;
        while !remaining.is_empty() {
            let chunk_words = span_words(address, remaining.len());
            self.set_tar(dp, address)?;

            let (chunk, rest) = remaining.split_at(chunk_words);
            dp.write_ap_repeated(self.apsel, DRW::ADDRESS, chunk)?;

            self.advance_tar(address, 4 * chunk_words as u32);
            address += 4 * chunk_words as u32;
            remaining = rest;
        }

        Ok(())
    }

    /// Read an arbitrary byte buffer: unaligned head and tail bytes go
    /// through byte lane accesses, the aligned middle as a word burst.
    pub fn read_8(
        &mut self,
        dp: &mut dyn DpAccess,
        address: u32,
        data: &mut [u8],
    ) -> Result<(), ArmError> {
        if data.is_empty() {
            return Ok(());
        }

        let head = ((4 - address % 4) % 4).min(data.len() as u32) as usize;
        let body_words = (data.len() - head) / 4;
        let tail_start = head + body_words * 4;

        for (i, byte) in data[..head].iter_mut().enumerate() {
            *byte = self.read_word_8(dp, address + i as u32)?;
        }

        if body_words > 0 {
            let mut words = vec![0u32; body_words];
            self.read_32(dp, address + head as u32, &mut words)?;
            for (i, word) in words.into_iter().enumerate() {
                data.pwrite_with(word, head + i * 4, LE).expect("in bounds");
            }
        }

        for i in tail_start..data.len() {
            data[i] = self.read_word_8(dp, address + i as u32)?;
        }

        Ok(())
    }

    /// Write an arbitrary byte buffer; the counterpart of [`Self::read_8`].
    pub fn write_8(
        &mut self,
        dp: &mut dyn DpAccess,
        address: u32,
        data: &[u8],
    ) -> Result<(), ArmError> {
        if data.is_empty() {
            return Ok(());
        }

        let head = ((4 - address % 4) % 4).min(data.len() as u32) as usize;
        let body_words = (data.len() - head) / 4;
        let tail_start = head + body_words * 4;

        for (i, byte) in data[..head].iter().enumerate() {
            self.write_word_8(dp, address + i as u32, *byte)?;
        }

        if body_words > 0 {
            let mut words = vec![0u32; body_words];
            for (i, word) in words.iter_mut().enumerate() {
                *word = data.pread_with(head + i * 4, LE).expect("in bounds");
            }
            self.write_32(dp, address + head as u32, &words)?;
        }

        for i in tail_start..data.len() {
            self.write_word_8(dp, address + i as u32, data[i])?;
        }

        Ok(())
    }
}

/// Words until the end of the current 1 KiB span, capped at `remaining`.
fn span_words(address: u32, remaining: usize) -> usize {
    let to_boundary = (AUTOINC_SPAN - address % AUTOINC_SPAN) / 4;
    (to_boundary as usize).min(remaining)
}

fn check_alignment(address: u32, alignment: u32) -> Result<(), ArmError> {
    if address % alignment != 0 {
        return Err(ArmError::MemoryNotAligned { address, alignment });
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::super::mock::MockDap;
    use super::super::IDR;
    use super::*;
    use pretty_assertions::assert_eq;

    fn memory_ap(dap: &mut MockDap) -> MemoryAp {
        let ap = GenericAp {
            apsel: 0,
            idr: IDR::from(dap.idr),
        };
        MemoryAp::new(dap, ap).unwrap()
    }

    #[test]
    fn word_roundtrip() {
        let mut dap = MockDap::new(0x2000_0000, 0x1000);
        let mut ap = memory_ap(&mut dap);

        ap.write_word_32(&mut dap, 0x2000_0010, 0xDEAD_BEEF).unwrap();
        assert_eq!(ap.read_word_32(&mut dap, 0x2000_0010).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn csw_is_programmed_once_for_same_size() {
        let mut dap = MockDap::new(0x2000_0000, 0x1000);
        let mut ap = memory_ap(&mut dap);

        ap.read_word_32(&mut dap, 0x2000_0000).unwrap();
        ap.read_word_32(&mut dap, 0x2000_0000).unwrap();
        assert_eq!(dap.csw_writes, 1);

        // A byte access needs a different CSW.
        ap.read_word_8(&mut dap, 0x2000_0000).unwrap();
        assert_eq!(dap.csw_writes, 2);
    }

    #[test]
    fn sequential_words_elide_tar() {
        let mut dap = MockDap::new(0x2000_0000, 0x1000);
        let mut ap = memory_ap(&mut dap);

        ap.write_word_32(&mut dap, 0x2000_0100, 1).unwrap();
        ap.write_word_32(&mut dap, 0x2000_0104, 2).unwrap();
        ap.write_word_32(&mut dap, 0x2000_0108, 3).unwrap();

        // The auto-increment keeps TAR in step; only the first write
        // programs it.
        assert_eq!(dap.tar_writes, vec![0x2000_0100]);
    }

    #[test]
    fn burst_splits_exactly_at_1k_boundaries() {
        let mut dap = MockDap::new(0x2000_0000, 0x1000);
        let mut ap = memory_ap(&mut dap);

        for (i, chunk) in (0..0x1000).step_by(4).enumerate() {
            dap.ram[chunk as usize..chunk as usize + 4]
                .copy_from_slice(&(i as u32).to_le_bytes());
        }

        // 512 words starting at +0x200: one TAR update at the start and
        // one at the boundary.
        let mut data = vec![0u32; 512];
        ap.read_32(&mut dap, 0x2000_0200, &mut data).unwrap();

        assert_eq!(dap.tar_writes, vec![0x2000_0200, 0x2000_0400]);
        let expected: Vec<u32> = (0x80..0x80 + 512).collect();
        assert_eq!(data, expected);
    }

    #[test]
    fn burst_split_survives_hardware_wraparound() {
        // The mock wraps its TAR auto-increment inside the 1 KiB span
        // just like real hardware; a burst crossing two boundaries must
        // still read linear data.
        let mut dap = MockDap::new(0x2000_0000, 0x1000);
        let mut ap = memory_ap(&mut dap);

        let data: Vec<u32> = (0..768).collect();
        ap.write_32(&mut dap, 0x2000_0000, &data).unwrap();

        let mut back = vec![0u32; 768];
        ap.read_32(&mut dap, 0x2000_0000, &mut back).unwrap();
        assert_eq!(back, data);
        assert_eq!(
            dap.tar_writes,
            vec![0x2000_0000, 0x2000_0400, 0x2000_0800, 0x2000_0000, 0x2000_0400, 0x2000_0800]
        );
    }

    #[test]
    fn unaligned_word_access_is_rejected() {
        let mut dap = MockDap::new(0x2000_0000, 0x1000);
        let mut ap = memory_ap(&mut dap);

        assert!(matches!(
            ap.read_word_32(&mut dap, 0x2000_0002),
            Err(ArmError::MemoryNotAligned { .. })
        ));
    }

    #[test]
    fn byte_buffer_roundtrip_with_ragged_edges() {
        let mut dap = MockDap::new(0x2000_0000, 0x1000);
        let mut ap = memory_ap(&mut dap);

        let data: Vec<u8> = (0..100u8).collect();
        ap.write_8(&mut dap, 0x2000_0003, &data).unwrap();

        let mut back = vec![0u8; 100];
        ap.read_8(&mut dap, 0x2000_0003, &mut back).unwrap();
        assert_eq!(back, data);

        // Bytes around the span stay untouched.
        assert_eq!(ap.read_word_8(&mut dap, 0x2000_0002).unwrap(), 0);
        assert_eq!(ap.read_word_8(&mut dap, 0x2000_0067).unwrap(), 0);
    }

    #[test]
    fn halfword_lane_shifting() {
        let mut dap = MockDap::new(0x2000_0000, 0x1000);
        let mut ap = memory_ap(&mut dap);

        ap.write_word_16(&mut dap, 0x2000_0002, 0xBE00).unwrap();
        assert_eq!(ap.read_word_16(&mut dap, 0x2000_0002).unwrap(), 0xBE00);
        // The lower halfword of the containing word is untouched.
        assert_eq!(ap.read_word_16(&mut dap, 0x2000_0000).unwrap(), 0);
        assert_eq!(
            ap.read_word_32(&mut dap, 0x2000_0000).unwrap(),
            0xBE00_0000
        );
    }
}
