// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Ethernet MAC, at interface level: register layout, MAC address setup,
//! and MDIO access to the PHY. Descriptor rings and the DMA engine belong
//! to the stack above this crate.

use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use tock_registers::register_bitfields;
use tock_registers::register_structs;
use tock_registers::registers::{ReadOnly, ReadWrite};

use cortexm4::StaticRef;

use crate::Error;

register_structs! {
    pub EthernetRegisters {
        /// MAC configuration.
        (0x0000 => mac_config: ReadWrite<u32, MAC_CONFIG::Register>),
        /// Receive frame filter.
        (0x0004 => mac_frame_filter: ReadWrite<u32, MAC_FRAME_FILTER::Register>),
        (0x0008 => mac_hashtable_high: ReadWrite<u32>),
        (0x000c => mac_hashtable_low: ReadWrite<u32>),
        /// MDIO address and command.
        (0x0010 => mac_mii_addr: ReadWrite<u32, MII_ADDR::Register>),
        /// MDIO data.
        (0x0014 => mac_mii_data: ReadWrite<u32>),
        (0x0018 => mac_flow_ctrl: ReadWrite<u32>),
        (0x001c => mac_vlan_tag: ReadWrite<u32>),
        (0x0020 => _reserved0),
        (0x0024 => mac_debug: ReadOnly<u32>),
        (0x0028 => mac_rwake_frflt: ReadWrite<u32>),
        (0x002c => mac_pmt_ctrl_stat: ReadWrite<u32>),
        (0x0030 => _reserved1),
        (0x0040 => mac_addr0_high: ReadWrite<u32>),
        (0x0044 => mac_addr0_low: ReadWrite<u32>),
        (0x0048 => @END),
    }
}

register_bitfields![u32,
    MAC_CONFIG [
        /// Receiver enable.
        RE OFFSET(2) NUMBITS(1) [],
        /// Transmitter enable.
        TE OFFSET(3) NUMBITS(1) [],
        /// Full duplex.
        DM OFFSET(11) NUMBITS(1) [],
        /// 100 Mbps when set (with PS), 10 Mbps otherwise.
        FES OFFSET(14) NUMBITS(1) [],
        /// Port select: MII/RMII.
        PS OFFSET(15) NUMBITS(1) []
    ],
    MAC_FRAME_FILTER [
        /// Promiscuous receive.
        PR OFFSET(0) NUMBITS(1) [],
        /// Pass all multicast.
        PM OFFSET(4) NUMBITS(1) [],
        /// Receive-all override.
        RA OFFSET(31) NUMBITS(1) []
    ],
    MII_ADDR [
        /// MDIO transaction in progress.
        GB OFFSET(0) NUMBITS(1) [],
        /// Write (1) or read (0).
        W OFFSET(1) NUMBITS(1) [],
        /// MDC clock range selection.
        CR OFFSET(2) NUMBITS(4) [],
        /// Register within the PHY.
        GR OFFSET(6) NUMBITS(5) [],
        /// PHY address.
        PA OFFSET(11) NUMBITS(5) []
    ]
];

pub const ETHERNET_BASE: StaticRef<EthernetRegisters> =
    unsafe { StaticRef::new(0x4001_0000 as *const EthernetRegisters) };

// MDIO polls are bounded by iteration count; the MAC answers within a few
// MDC cycles or not at all.
const MII_BUSY_ITERATIONS: u32 = 100_000;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Speed {
    Mbps10,
    Mbps100,
}

pub struct Ethernet {
    registers: StaticRef<EthernetRegisters>,
}

impl Ethernet {
    pub const fn new(registers: StaticRef<EthernetRegisters>) -> Ethernet {
        Ethernet { registers }
    }

    /// Program the station address and basic filtering; the MAC stays
    /// disabled until `enable` is called.
    pub fn initialize(&self, mac_address: &[u8; 6]) {
        self.registers.mac_addr0_low.set(u32::from_le_bytes([
            mac_address[0],
            mac_address[1],
            mac_address[2],
            mac_address[3],
        ]));
        self.registers
            .mac_addr0_high
            .set(u32::from_le_bytes([mac_address[4], mac_address[5], 0, 0]));

        self.registers.mac_frame_filter.set(0);
    }

    pub fn enable(&self, speed: Speed, full_duplex: bool) {
        self.registers.mac_config.modify(
            MAC_CONFIG::PS::SET
                + MAC_CONFIG::FES.val((speed == Speed::Mbps100) as u32)
                + MAC_CONFIG::DM.val(full_duplex as u32)
                + MAC_CONFIG::RE::SET
                + MAC_CONFIG::TE::SET,
        );
    }

    pub fn disable(&self) {
        self.registers
            .mac_config
            .modify(MAC_CONFIG::RE::CLEAR + MAC_CONFIG::TE::CLEAR);
    }

    fn wait_mii_idle(&self) -> Result<(), Error> {
        for _ in 0..MII_BUSY_ITERATIONS {
            if !self.registers.mac_mii_addr.is_set(MII_ADDR::GB) {
                return Ok(());
            }
        }
        Err(Error::Timeout)
    }

    /// Read one PHY register over MDIO.
    pub fn read_phy(&self, phy: u8, register: u8) -> Result<u16, Error> {
        self.wait_mii_idle()?;
        self.registers.mac_mii_addr.write(
            MII_ADDR::PA.val(phy as u32)
                + MII_ADDR::GR.val(register as u32)
                + MII_ADDR::W::CLEAR
                + MII_ADDR::GB::SET,
        );
        self.wait_mii_idle()?;
        Ok(self.registers.mac_mii_data.get() as u16)
    }

    /// Write one PHY register over MDIO.
    pub fn write_phy(&self, phy: u8, register: u8, value: u16) -> Result<(), Error> {
        self.wait_mii_idle()?;
        self.registers.mac_mii_data.set(value as u32);
        self.registers.mac_mii_addr.write(
            MII_ADDR::PA.val(phy as u32)
                + MII_ADDR::GR.val(register as u32)
                + MII_ADDR::W::SET
                + MII_ADDR::GB::SET,
        );
        self.wait_mii_idle()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;

    fn fake_ethernet() -> Ethernet {
        let mem = std::vec![0u32; 0x48 / 4].into_boxed_slice();
        let registers = unsafe {
            StaticRef::new(std::boxed::Box::leak(mem).as_ptr() as *const EthernetRegisters)
        };
        Ethernet::new(registers)
    }

    #[test]
    fn station_address_is_split_across_the_register_pair() {
        let ethernet = fake_ethernet();
        ethernet.initialize(&[0x02, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E]);

        assert_eq!(ethernet.registers.mac_addr0_low.get(), 0x0C0B_0A02);
        assert_eq!(ethernet.registers.mac_addr0_high.get(), 0x0000_0E0D);
    }

    #[test]
    fn enable_sets_duplex_and_speed() {
        let ethernet = fake_ethernet();
        ethernet.enable(Speed::Mbps100, true);

        let config = &ethernet.registers.mac_config;
        assert_eq!(config.read(MAC_CONFIG::RE), 1);
        assert_eq!(config.read(MAC_CONFIG::TE), 1);
        assert_eq!(config.read(MAC_CONFIG::DM), 1);
        assert_eq!(config.read(MAC_CONFIG::FES), 1);

        ethernet.disable();
        assert_eq!(config.read(MAC_CONFIG::RE), 0);
        assert_eq!(config.read(MAC_CONFIG::TE), 0);
    }
}
