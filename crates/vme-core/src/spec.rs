//! VME64/VME64x addressing and transfer mode tables.
//!
//! Everything in this module is static protocol data. Devices pick an
//! [`AddressingMode`] and a pair of [`TransferMode`]s once, and [`ModeSet::new`]
//! resolves the address modifiers up front so an unsupported combination is
//! rejected when the device is constructed, never in the middle of a transfer.
//!
//! # Address modifier table
//!
//! | Kind            | A16  | A24  | A32  | A40  | A64  |
//! |-----------------|------|------|------|------|------|
//! | Lock            | 0x2C | 0x32 | 0x05 | 0x35 | 0x04 |
//! | Data            | 0x29 | 0x39 | 0x09 | 0x34 | 0x01 |
//! | Data (sup.)     | 0x2D | 0x3D | 0x0D |      |      |
//! | Program         |      | 0x3A | 0x0A |      |      |
//! | Program (sup.)  |      | 0x3E | 0x0E |      |      |
//! | BLT             |      | 0x3B | 0x0B |      | 0x03 |
//! | BLT (sup.)      |      | 0x3F | 0x0F |      |      |
//! | MBLT            |      | 0x38 | 0x08 |      | 0x00 |
//! | MBLT (sup.)     |      | 0x3C | 0x0C |      |      |
//! | MD32            |      |      |      | 0x37 |      |
//! | 2eVME 3U        |      |      | 0x21 | 0x21 |      |
//! | 2eVME 6U        |      |      | 0x20 |      | 0x20 |
//! | CS/CSR          |      | 0x2F |      |      |      |
//!
//! Supervisory codes are obsolete (68000 supervisor mode) and kept only for
//! completeness; devices use the non-privileged variants.

use std::fmt;

use crate::error::{Result, VmeError};

/// Bus address width/class of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressingMode {
    /// Short I/O addressing.
    A16,
    /// Standard addressing.
    A24,
    /// Extended addressing.
    A32,
    /// Primarily used by 3U modules.
    A40,
    /// Long addressing.
    A64,
}

impl AddressingMode {
    /// All addressing modes, narrowest first.
    pub const ALL: [AddressingMode; 5] = [Self::A16, Self::A24, Self::A32, Self::A40, Self::A64];

    /// Number of significant address bits.
    pub const fn address_bits(self) -> u32 {
        match self {
            Self::A16 => 16,
            Self::A24 => 24,
            Self::A32 => 32,
            Self::A40 => 40,
            Self::A64 => 64,
        }
    }

    /// Largest address reachable in this mode.
    pub const fn max_address(self) -> u64 {
        match self {
            Self::A64 => u64::MAX,
            other => (1u64 << other.address_bits()) - 1,
        }
    }

    /// Whether `address` fits in this mode's address width.
    pub const fn contains(self, address: u64) -> bool {
        address <= self.max_address()
    }
}

impl fmt::Display for AddressingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::A16 => "A16",
            Self::A24 => "A24",
            Self::A32 => "A32",
            Self::A40 => "A40",
            Self::A64 => "A64",
        };
        f.write_str(name)
    }
}

/// Width of a single data element on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataWidth {
    /// 8-bit
    D8,
    /// 16-bit
    D16,
    /// 32-bit
    D32,
    /// 64-bit
    D64,
}

impl DataWidth {
    /// Width in bytes.
    pub const fn bytes(self) -> usize {
        match self {
            Self::D8 => 1,
            Self::D16 => 2,
            Self::D32 => 4,
            Self::D64 => 8,
        }
    }

    /// Mask selecting the bits a value of this width can carry.
    pub const fn mask(self) -> u64 {
        match self {
            Self::D64 => u64::MAX,
            other => (1u64 << (other.bytes() * 8)) - 1,
        }
    }
}

/// Data transfer modes (VME64/VME64x).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferMode {
    /// 8-bit transfer at odd addresses (slave only).
    D08Odd,
    /// 8-bit transfer.
    D08EvenOdd,
    /// 16-bit transfer.
    D16,
    /// 32-bit transfer (6U only).
    D32,
    /// 32-bit multiplexed transfer (3U and 6U).
    Md32,
    /// 64-bit multiplexed block transfer (6U only).
    Mblt,
    /// 64-bit two-edge transfer for 3U modules (VME64x).
    TwoEdge3U,
    /// 64-bit two-edge transfer for 6U modules (VME64x).
    TwoEdge6U,
}

impl TransferMode {
    /// All transfer modes.
    pub const ALL: [TransferMode; 8] = [
        Self::D08Odd,
        Self::D08EvenOdd,
        Self::D16,
        Self::D32,
        Self::Md32,
        Self::Mblt,
        Self::TwoEdge3U,
        Self::TwoEdge6U,
    ];

    /// Element width on the bus.
    pub const fn data_width(self) -> DataWidth {
        match self {
            Self::D08Odd | Self::D08EvenOdd => DataWidth::D8,
            Self::D16 => DataWidth::D16,
            Self::D32 | Self::Md32 => DataWidth::D32,
            Self::Mblt | Self::TwoEdge3U | Self::TwoEdge6U => DataWidth::D64,
        }
    }

    /// Element width in bytes.
    pub const fn width(self) -> usize {
        self.data_width().bytes()
    }

    /// Nominal maximum length of one block transaction, in bytes.
    ///
    /// BLT-class transfers are limited to 256 bytes, 64-bit multiplexed
    /// transfers to 2 KB.
    pub const fn max_block_bytes(self) -> usize {
        match self {
            Self::Mblt | Self::TwoEdge3U | Self::TwoEdge6U => 2048,
            _ => 256,
        }
    }

    /// Nominal maximum number of elements in one block transaction.
    pub const fn max_block_elements(self) -> usize {
        self.max_block_bytes() / self.width()
    }

    /// Multiplexed modes only exist as block transfers.
    pub const fn is_multiplexed(self) -> bool {
        matches!(
            self,
            Self::Md32 | Self::Mblt | Self::TwoEdge3U | Self::TwoEdge6U
        )
    }

    /// Address modifier kind used when this mode moves a block.
    pub const fn block_kind(self) -> ModifierKind {
        match self {
            Self::D08Odd | Self::D08EvenOdd | Self::D16 | Self::D32 => ModifierKind::Blt,
            Self::Md32 => ModifierKind::Md32,
            Self::Mblt => ModifierKind::Mblt,
            Self::TwoEdge3U => ModifierKind::TwoEdge3U,
            Self::TwoEdge6U => ModifierKind::TwoEdge6U,
        }
    }

    /// Whether this is one of the two-edge (2eVME) variants.
    pub const fn is_two_edge(self) -> bool {
        matches!(self, Self::TwoEdge3U | Self::TwoEdge6U)
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::D08Odd => "D08(O)",
            Self::D08EvenOdd => "D08(EO)",
            Self::D16 => "D16",
            Self::D32 => "D32",
            Self::Md32 => "MD32",
            Self::Mblt => "MBLT",
            Self::TwoEdge3U => "2eVME-3U",
            Self::TwoEdge6U => "2eVME-6U",
        };
        f.write_str(name)
    }
}

/// Protocol-level address modifier classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModifierKind {
    /// Lock command (LCK).
    Lock,
    /// Non-privileged data access.
    Data,
    /// Supervisory data access (obsolete).
    SupervisoryData,
    /// Non-privileged program access.
    Program,
    /// Supervisory program access (obsolete).
    SupervisoryProgram,
    /// Block transfer (BLT).
    Blt,
    /// Supervisory block transfer (obsolete).
    SupervisoryBlt,
    /// 64-bit multiplexed block transfer.
    Mblt,
    /// Supervisory MBLT (obsolete).
    SupervisoryMblt,
    /// 32-bit multiplexed block transfer.
    Md32,
    /// 2eVME for 3U modules.
    TwoEdge3U,
    /// 2eVME for 6U modules.
    TwoEdge6U,
    /// Control/status register space (A24 only).
    CsCsr,
}

/// Look up the address modifier code for `kind` in `addressing`.
///
/// Returns `None` when the VME64 standard does not define the combination.
pub const fn address_modifier(addressing: AddressingMode, kind: ModifierKind) -> Option<u8> {
    use AddressingMode::*;
    use ModifierKind::*;

    let code = match (addressing, kind) {
        (A16, Lock) => 0x2C,
        (A16, Data) => 0x29,
        (A16, SupervisoryData) => 0x2D,

        (A24, Lock) => 0x32,
        (A24, Data) => 0x39,
        (A24, Blt) => 0x3B,
        (A24, Mblt) => 0x38,
        (A24, Program) => 0x3A,
        (A24, SupervisoryData) => 0x3D,
        (A24, SupervisoryBlt) => 0x3F,
        (A24, SupervisoryMblt) => 0x3C,
        (A24, SupervisoryProgram) => 0x3E,
        (A24, CsCsr) => 0x2F,

        (A32, Lock) => 0x05,
        (A32, Data) => 0x09,
        (A32, Blt) => 0x0B,
        (A32, Mblt) => 0x08,
        (A32, Program) => 0x0A,
        (A32, SupervisoryData) => 0x0D,
        (A32, SupervisoryBlt) => 0x0F,
        (A32, SupervisoryMblt) => 0x0C,
        (A32, SupervisoryProgram) => 0x0E,
        (A32, TwoEdge3U) => 0x21,
        (A32, TwoEdge6U) => 0x20,

        (A40, Lock) => 0x35,
        (A40, Data) => 0x34,
        (A40, Md32) => 0x37,
        (A40, TwoEdge3U) => 0x21,

        (A64, Lock) => 0x04,
        (A64, Data) => 0x01,
        (A64, Blt) => 0x03,
        (A64, Mblt) => 0x00,
        (A64, TwoEdge6U) => 0x20,

        _ => return None,
    };
    Some(code)
}

/// Extended address modifier (XAM) for 2eVME block transfers.
///
/// Only defined for the two-edge modes. The 3U XAM codes are not
/// tabulated, so 2eVME-3U resolves to `None` everywhere.
pub const fn extended_modifier(addressing: AddressingMode, mode: TransferMode) -> Option<u8> {
    match (addressing, mode) {
        (AddressingMode::A32, TransferMode::TwoEdge6U) => Some(0x01),
        (AddressingMode::A64, TransferMode::TwoEdge6U) => Some(0x02),
        _ => None,
    }
}

/// Resolved address modifier handed to the bus backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressModifier {
    /// AM code.
    pub code: u8,
    /// XAM code, present for 2eVME transfers only.
    pub extended: Option<u8>,
}

impl AddressModifier {
    /// Modifier for a single-cycle transfer.
    ///
    /// Multiplexed modes cannot be used for single transfers.
    pub fn single(addressing: AddressingMode, mode: TransferMode) -> Result<Self> {
        if mode.is_multiplexed() {
            return Err(VmeError::UnsupportedMode {
                addressing,
                mode,
                reason: "multiplexed modes only support block transfers",
            });
        }
        let code = address_modifier(addressing, ModifierKind::Data).ok_or(
            VmeError::UnsupportedMode {
                addressing,
                mode,
                reason: "no data address modifier",
            },
        )?;
        Ok(Self {
            code,
            extended: None,
        })
    }

    /// Modifier for a block transfer in `mode`.
    pub fn block(addressing: AddressingMode, mode: TransferMode) -> Result<Self> {
        let code = address_modifier(addressing, mode.block_kind()).ok_or(
            VmeError::UnsupportedMode {
                addressing,
                mode,
                reason: "no block transfer address modifier",
            },
        )?;
        let extended = if mode.is_two_edge() {
            Some(extended_modifier(addressing, mode).ok_or(VmeError::UnsupportedMode {
                addressing,
                mode,
                reason: "no extended address modifier",
            })?)
        } else {
            None
        };
        Ok(Self { code, extended })
    }
}

impl fmt::Display for AddressModifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.extended {
            Some(xam) => write!(f, "AM 0x{:02X} (XAM 0x{:02X})", self.code, xam),
            None => write!(f, "AM 0x{:02X}", self.code),
        }
    }
}

/// Validated addressing/transfer mode combination of one device.
///
/// Constructing a `ModeSet` resolves both address modifiers, so a device
/// holding one can no longer hit an unsupported combination at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeSet {
    addressing: AddressingMode,
    single: TransferMode,
    block: TransferMode,
    single_modifier: AddressModifier,
    block_modifier: AddressModifier,
}

impl ModeSet {
    /// Validate `single` for single cycles and `block` for block transfers.
    pub fn new(addressing: AddressingMode, single: TransferMode, block: TransferMode) -> Result<Self> {
        Ok(Self {
            addressing,
            single,
            block,
            single_modifier: AddressModifier::single(addressing, single)?,
            block_modifier: AddressModifier::block(addressing, block)?,
        })
    }

    /// Same mode for single and block transfers.
    pub fn uniform(addressing: AddressingMode, mode: TransferMode) -> Result<Self> {
        Self::new(addressing, mode, mode)
    }

    /// Addressing mode.
    pub fn addressing(&self) -> AddressingMode {
        self.addressing
    }

    /// Transfer mode of single cycles.
    pub fn single(&self) -> TransferMode {
        self.single
    }

    /// Transfer mode of block transfers.
    pub fn block(&self) -> TransferMode {
        self.block
    }

    /// Resolved single-cycle modifier.
    pub fn single_modifier(&self) -> AddressModifier {
        self.single_modifier
    }

    /// Resolved block modifier.
    pub fn block_modifier(&self) -> AddressModifier {
        self.block_modifier
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_lengths() {
        assert_eq!(TransferMode::D08EvenOdd.max_block_elements(), 256);
        assert_eq!(TransferMode::D16.max_block_elements(), 128);
        assert_eq!(TransferMode::D32.max_block_elements(), 64);
        assert_eq!(TransferMode::Md32.max_block_elements(), 64);
        assert_eq!(TransferMode::Mblt.max_block_elements(), 256);
        assert_eq!(TransferMode::TwoEdge6U.max_block_elements(), 256);
    }

    #[test]
    fn test_widths_and_blocks_positive() {
        for mode in TransferMode::ALL {
            assert!(mode.width() > 0, "{mode}");
            assert!(mode.max_block_elements() > 0, "{mode}");
            assert_eq!(mode.width() * mode.max_block_elements(), mode.max_block_bytes());
        }
    }

    #[test]
    fn test_multiplexed_modes() {
        let multiplexed: Vec<_> = TransferMode::ALL
            .into_iter()
            .filter(|m| m.is_multiplexed())
            .collect();
        assert_eq!(
            multiplexed,
            vec![
                TransferMode::Md32,
                TransferMode::Mblt,
                TransferMode::TwoEdge3U,
                TransferMode::TwoEdge6U
            ]
        );
    }

    #[test]
    fn test_data_modifier_defined_everywhere() {
        for addressing in AddressingMode::ALL {
            assert!(address_modifier(addressing, ModifierKind::Data).is_some());
            assert!(address_modifier(addressing, ModifierKind::Lock).is_some());
        }
    }

    #[test]
    fn test_modifier_codes() {
        assert_eq!(address_modifier(AddressingMode::A32, ModifierKind::Mblt), Some(0x08));
        assert_eq!(address_modifier(AddressingMode::A24, ModifierKind::CsCsr), Some(0x2F));
        assert_eq!(address_modifier(AddressingMode::A40, ModifierKind::Md32), Some(0x37));
        assert_eq!(address_modifier(AddressingMode::A16, ModifierKind::Blt), None);
        assert_eq!(address_modifier(AddressingMode::A32, ModifierKind::CsCsr), None);
    }

    #[test]
    fn test_extended_modifier_only_for_two_edge() {
        for addressing in AddressingMode::ALL {
            for mode in TransferMode::ALL {
                if !mode.is_two_edge() {
                    assert_eq!(extended_modifier(addressing, mode), None);
                }
            }
        }
        assert_eq!(
            extended_modifier(AddressingMode::A32, TransferMode::TwoEdge6U),
            Some(0x01)
        );
        assert_eq!(
            extended_modifier(AddressingMode::A64, TransferMode::TwoEdge6U),
            Some(0x02)
        );
    }

    #[test]
    fn test_single_rejects_multiplexed() {
        let err = AddressModifier::single(AddressingMode::A32, TransferMode::Mblt).unwrap_err();
        assert!(matches!(err, VmeError::UnsupportedMode { .. }));
    }

    #[test]
    fn test_block_two_edge_carries_xam() {
        let am = AddressModifier::block(AddressingMode::A32, TransferMode::TwoEdge6U).unwrap();
        assert_eq!(am.code, 0x20);
        assert_eq!(am.extended, Some(0x01));
        assert!(AddressModifier::block(AddressingMode::A32, TransferMode::TwoEdge3U).is_err());
    }

    #[test]
    fn test_device_mode_sets_resolve() {
        // Combinations used by the CAEN boards
        let sets = [
            (AddressingMode::A32, TransferMode::D32, TransferMode::Mblt),
            (AddressingMode::A24, TransferMode::D16, TransferMode::D16),
            (AddressingMode::A32, TransferMode::D16, TransferMode::D16),
            (AddressingMode::A24, TransferMode::D32, TransferMode::Mblt),
        ];
        for (addressing, single, block) in sets {
            let set = ModeSet::new(addressing, single, block).unwrap();
            assert_eq!(set.single_modifier().extended, None);
        }
        assert!(ModeSet::uniform(AddressingMode::A16, TransferMode::D16).is_err());
    }

    #[test]
    fn test_address_ranges() {
        assert!(AddressingMode::A16.contains(0xFFFF));
        assert!(!AddressingMode::A16.contains(0x1_0000));
        assert!(AddressingMode::A32.contains(0xFFFF_FFFF));
        assert!(AddressingMode::A64.contains(u64::MAX));
    }
}
