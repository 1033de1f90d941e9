//! The link controller device: register file, shared RAM window and the
//! per-tick protocol engine that frames transfers and times the interrupt
//! line.

use std::collections::VecDeque;

use log::{debug, trace};

use crate::transport::{LinkConfig, SendError, link_id};

/// Fixed wire block size. Payload words pack big-endian from offset 0; the
/// last two bytes carry the link id and the word count.
pub const FRAME_LEN: usize = 1024;

/// Shared RAM window, word-addressed. Receive traffic lands in the upper
/// half starting at word 0x1000.
pub const RAM_WORDS: usize = 0x2000;

const RAM_MASK: usize = 0x1fff;
const RAM_DATA_MASK: u16 = 0x01ff;

const FRAME_LINK_ID: usize = FRAME_LEN - 2;
const FRAME_WORD_COUNT: usize = FRAME_LEN - 1;

/// Simulated ticks per transferred word, modelling the serial line rate.
const TICKS_PER_WORD: u32 = 12;
const IRQ_HOLD_TICKS: u16 = 4;

const REG_STATUS: usize = 0;
const REG_MODE: usize = 1;
const REG_CONTROL: usize = 2;
const REG_START: usize = 3;
const REG_RXSIZE: usize = 4;
const REG_TXSIZE: usize = 5;
const REG_RXOFFSET: usize = 6;
const REG_TXOFFSET: usize = 7;

const STATUS_SYNC: u16 = 0x0002;
const STATUS_TX_IDLE: u16 = 0x0004;
const STATUS_RX_IDLE: u16 = 0x0008;
const CONTROL_HALT: u16 = 0x0001;

/// Transport seam between the protocol engine and the network plumbing.
///
/// All operations are non-blocking; the engine polls once per tick.
pub trait FrameLink: Send {
    /// Tear down and restart the transport with new endpoints.
    fn reset(&mut self, config: &LinkConfig);

    /// Synchronous shutdown; no transport activity remains afterwards.
    fn stop(&mut self);

    /// True only when both link directions are up.
    fn connected(&self) -> bool;

    /// Queue one frame for the peer. Nothing is queued on error.
    fn send(&mut self, frame: &[u8]) -> Result<usize, SendError>;

    /// Pull exactly `out.len()` bytes. `None` when the receive direction is
    /// down, `Some(0)` when not enough bytes have arrived yet.
    fn receive(&mut self, out: &mut [u8]) -> Option<usize>;
}

/// A stub link used when no network is attached.
/// By default both directions read as down, so transfers park until a real
/// transport is connected. When `loopback` is true the link is up and sent
/// bytes queue straight back to the receiver.
#[derive(Default)]
pub struct NullFrameLink {
    loopback: bool,
    queue: VecDeque<u8>,
}

impl NullFrameLink {
    pub fn new(loopback: bool) -> Self {
        Self {
            loopback,
            queue: VecDeque::new(),
        }
    }
}

impl FrameLink for NullFrameLink {
    fn reset(&mut self, _config: &LinkConfig) {
        self.queue.clear();
    }

    fn stop(&mut self) {
        self.queue.clear();
    }

    fn connected(&self) -> bool {
        self.loopback
    }

    fn send(&mut self, frame: &[u8]) -> Result<usize, SendError> {
        if !self.loopback {
            return Err(SendError::NotConnected);
        }
        self.queue.extend(frame);
        Ok(frame.len())
    }

    fn receive(&mut self, out: &mut [u8]) -> Option<usize> {
        if !self.loopback {
            return None;
        }
        if self.queue.len() < out.len() {
            return Some(0);
        }
        for byte in out.iter_mut() {
            *byte = self.queue.pop_front().unwrap_or(0);
        }
        Some(out.len())
    }
}

/// Consumer of the interrupt request line. Called on latched edges only.
pub trait IrqSink: Send {
    fn set_irq(&mut self, asserted: bool);
}

/// Discards interrupt edges; hosts that care connect their own sink.
#[derive(Default)]
pub struct NullIrqSink;

impl IrqSink for NullIrqSink {
    fn set_irq(&mut self, _asserted: bool) {}
}

/// Register file, RAM window and transfer timing for one link node.
///
/// The host drives this from its emulation thread: bus accesses through
/// `read_reg`/`write_reg`/`read_ram`/`write_ram`, and one `tick()` per
/// simulated clock pulse. None of it blocks; the network runs behind the
/// [`FrameLink`].
pub struct LinkDevice {
    regs: [u16; 8],
    ram: Box<[u16]>,
    link_id: u8,
    irq_state: bool,
    irq_hold: u16,
    tx_block: u32,
    tx_delay: u32,
    rx_delay: u32,
    frame: [u8; FRAME_LEN],
    link: Box<dyn FrameLink>,
    irq: Box<dyn IrqSink>,
}

impl LinkDevice {
    pub fn new() -> Self {
        Self {
            regs: [0; 8],
            ram: vec![0; RAM_WORDS].into_boxed_slice(),
            link_id: 0,
            irq_state: false,
            irq_hold: 0,
            tx_block: 0,
            tx_delay: 0,
            rx_delay: 0,
            frame: [0; FRAME_LEN],
            link: Box::new(NullFrameLink::default()),
            irq: Box::new(NullIrqSink),
        }
    }

    pub fn connect_link(&mut self, link: Box<dyn FrameLink>) {
        self.link = link;
    }

    pub fn connect_irq(&mut self, irq: Box<dyn IrqSink>) {
        self.irq = irq;
    }

    /// Reset to power-on defaults and restart the transport with `config`.
    pub fn reset(&mut self, config: &LinkConfig) {
        self.ram.fill(0);
        self.regs = [0; 8];
        self.regs[REG_MODE] = 0x000f;
        self.regs[REG_RXOFFSET] = 0x1000;

        self.link_id = link_id(config);
        debug!("link: id byte = {:02x}", self.link_id);
        self.link.reset(config);

        self.irq_state = false;
        self.irq_hold = 0;
        self.tx_block = 0;
        self.tx_delay = 0;
        self.rx_delay = 0;
    }

    /// Blocking shutdown of the transport; the register file stays readable.
    pub fn stop(&mut self) {
        self.link.stop();
        self.irq_state = false;
        self.irq_hold = 0;
        self.tx_block = 0;
        self.tx_delay = 0;
        self.rx_delay = 0;
    }

    pub fn link_connected(&self) -> bool {
        self.link.connected()
    }

    pub fn link_id(&self) -> u8 {
        self.link_id
    }

    pub fn irq_asserted(&self) -> bool {
        self.irq_state
    }

    pub fn read_ram(&self, offset: usize) -> u16 {
        self.ram[offset & RAM_MASK]
    }

    pub fn write_ram(&mut self, offset: usize, value: u16) {
        self.ram[offset & RAM_MASK] = value & RAM_DATA_MASK;
    }

    pub fn read_reg(&self, offset: usize) -> u16 {
        let reg = offset & 0x07;
        let mut value = self.regs[reg];
        match reg {
            REG_STATUS => {
                if self.regs[REG_TXSIZE] == 0 {
                    value |= STATUS_TX_IDLE;
                }
                if self.regs[REG_RXSIZE] == 0 {
                    value |= STATUS_RX_IDLE;
                }
            }
            // the receive offset never reads below the upper RAM half
            REG_RXOFFSET => value |= 0x1000,
            _ => {}
        }
        trace!("link: reg_r[{reg:02x}] = {value:04x}");
        value
    }

    pub fn write_reg(&mut self, offset: usize, value: u16) {
        // registers are mirrored and limited in width
        let reg = offset & 0x07;
        let value = value
            & match reg {
                REG_STATUS | REG_MODE => 0x000f,
                REG_CONTROL | REG_START => 0x0003,
                REG_RXSIZE | REG_TXSIZE => 0x00ff,
                _ => 0x1fff,
            };
        trace!("link: reg_w[{reg:02x}] = {value:04x}");
        self.regs[reg] = value;

        match reg {
            REG_STATUS => {
                // any status write acknowledges the interrupt
                self.regs[REG_STATUS] = 0;
                self.irq_hold = 0;
                self.irq_state = false;
                self.irq.set_irq(false);
            }
            REG_TXSIZE => self.tx_block = u32::from(value) * TICKS_PER_WORD,
            _ => {}
        }
    }

    /// One simulated clock pulse: interrupt timing, transfer-delay
    /// bookkeeping, then at most one transmit and one receive pass.
    pub fn tick(&mut self) {
        // hold the line for a moment before dropping it
        let mut new_state = self.irq_state;
        if self.irq_hold > 0 {
            self.irq_hold -= 1;
            if self.irq_hold == 0 {
                new_state = false;
            }
        }

        if self.mode_asserts() {
            new_state = true;
            // the hardware parks in mode 0x0f once it has signalled
            self.regs[REG_MODE] = 0x000f;
        }

        if new_state != self.irq_state {
            self.irq_hold = IRQ_HOLD_TICKS;
            self.irq_state = new_state;
            self.irq.set_irq(new_state);
        }

        if self.tx_block > 0 {
            self.tx_block -= 1;
        }

        // prevent completing a send too fast
        if self.tx_delay > 0 {
            self.tx_delay -= 1;
            if self.tx_delay == 0 {
                self.regs[REG_TXSIZE] = 0;
            }
        }

        // prevent receiving too fast
        if self.rx_delay > 0 {
            self.rx_delay -= 1;
        }

        if self.tx_block == 0 && self.tx_delay == 0 {
            self.transmit_pass();
        }
        if self.rx_delay == 0 {
            self.receive_pass();
        }
    }

    fn mode_asserts(&self) -> bool {
        let rx_done = self.regs[REG_RXSIZE] == 0;
        let tx_done = self.regs[REG_TXSIZE] == 0;
        let sync = self.regs[REG_STATUS] & STATUS_SYNC != 0;
        match self.regs[REG_MODE] {
            0x00..=0x03 => rx_done || tx_done,
            0x04 | 0x05 => rx_done || sync,
            0x06 | 0x07 => rx_done,
            0x08..=0x0b => tx_done,
            0x0c | 0x0d => sync,
            _ => false,
        }
    }

    fn transmit_pass(&mut self) {
        if self.regs[REG_CONTROL] & CONTROL_HALT != 0 {
            return;
        }
        let count = usize::from(self.regs[REG_TXSIZE]);
        if count == 0 {
            return;
        }

        let offset = usize::from(self.regs[REG_TXOFFSET]);
        // modes with bit0 clear carry byte-wide data; receivers key off a
        // marker bit in the final byte instead of the sync bits
        let sync_words = self.regs[REG_MODE] & 0x0001 != 0;
        trace!(
            "link: tx mode={:02x} offset={offset:04x} count={count:02x}",
            self.regs[REG_MODE]
        );

        let mut pos = 0;
        for step in 0..count {
            let mut word = self.ram[(offset + step) & RAM_MASK];
            if !sync_words {
                word &= 0x00ff;
            }
            self.frame[pos..pos + 2].copy_from_slice(&word.to_be_bytes());
            pos += 2;
        }
        if !sync_words {
            self.frame[pos - 1] |= 0x01;
        }

        self.frame[FRAME_LINK_ID] = self.link_id;
        self.frame[FRAME_WORD_COUNT] = count as u8;

        // a rejected frame is rebuilt and retried on a later eligible tick
        if self.link.send(&self.frame).is_ok() {
            self.tx_delay = count as u32 * TICKS_PER_WORD;
        }
    }

    fn receive_pass(&mut self) {
        match self.link.receive(&mut self.frame) {
            Some(FRAME_LEN) => {}
            _ => return,
        }

        let count = usize::from(self.frame[FRAME_WORD_COUNT]);
        let offset = usize::from(self.regs[REG_RXOFFSET]);
        trace!("link: rx offset={offset:04x} count={count:02x}");

        for step in 0..count {
            let word = u16::from_be_bytes([self.frame[step * 2], self.frame[step * 2 + 1]]);
            self.ram[0x1000 + ((offset + step) & 0x0fff)] = word;
            if word & 0x0100 != 0 {
                self.regs[REG_STATUS] |= STATUS_SYNC;
            }
        }

        self.regs[REG_RXSIZE] = self.regs[REG_RXSIZE].wrapping_sub(count as u16) & 0x00ff;
        self.regs[REG_RXOFFSET] = self.regs[REG_RXOFFSET].wrapping_add(count as u16) & 0x0fff;
        self.rx_delay = count as u32 * TICKS_PER_WORD;
    }
}

impl Default for LinkDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct TestLinkState {
        connected: bool,
        reject_sends: bool,
        attempts: usize,
        sent: Vec<Vec<u8>>,
        incoming: VecDeque<u8>,
    }

    #[derive(Clone, Default)]
    struct TestLink(Arc<Mutex<TestLinkState>>);

    impl TestLink {
        fn online() -> Self {
            let link = Self::default();
            link.0.lock().expect("state lock").connected = true;
            link
        }

        fn queue_frame(&self, words: &[u16], count: u8) {
            let mut frame = [0u8; FRAME_LEN];
            for (step, word) in words.iter().enumerate() {
                frame[step * 2..step * 2 + 2].copy_from_slice(&word.to_be_bytes());
            }
            frame[FRAME_WORD_COUNT] = count;
            self.0.lock().expect("state lock").incoming.extend(frame);
        }
    }

    impl FrameLink for TestLink {
        fn reset(&mut self, _config: &LinkConfig) {}

        fn stop(&mut self) {}

        fn connected(&self) -> bool {
            self.0.lock().expect("state lock").connected
        }

        fn send(&mut self, frame: &[u8]) -> Result<usize, SendError> {
            let mut state = self.0.lock().expect("state lock");
            state.attempts += 1;
            if !state.connected {
                return Err(SendError::NotConnected);
            }
            if state.reject_sends {
                return Err(SendError::Overflow);
            }
            state.sent.push(frame.to_vec());
            Ok(frame.len())
        }

        fn receive(&mut self, out: &mut [u8]) -> Option<usize> {
            let mut state = self.0.lock().expect("state lock");
            if !state.connected {
                return None;
            }
            if state.incoming.len() < out.len() {
                return Some(0);
            }
            for byte in out.iter_mut() {
                *byte = state.incoming.pop_front().unwrap_or(0);
            }
            Some(out.len())
        }
    }

    #[derive(Clone, Default)]
    struct RecordingIrq(Arc<Mutex<Vec<bool>>>);

    impl IrqSink for RecordingIrq {
        fn set_irq(&mut self, asserted: bool) {
            self.0.lock().expect("edge lock").push(asserted);
        }
    }

    fn device_with(link: TestLink) -> LinkDevice {
        let mut device = LinkDevice::new();
        device.connect_link(Box::new(link));
        device.reset(&LinkConfig::default());
        device
    }

    #[test]
    fn reset_applies_power_on_defaults() {
        let mut device = LinkDevice::new();
        device.reset(&LinkConfig::default());

        assert_eq!(device.read_reg(REG_MODE), 0x000f);
        assert_eq!(device.read_reg(REG_RXOFFSET), 0x1000);
        assert_eq!(device.read_reg(REG_TXOFFSET), 0x0000);
        // both sizes are zero, so status reads idle in both directions
        assert_eq!(device.read_reg(REG_STATUS), STATUS_TX_IDLE | STATUS_RX_IDLE);
        assert!(!device.irq_asserted());
    }

    #[test]
    fn reset_recomputes_link_id_from_remote_endpoint() {
        let mut device = LinkDevice::new();
        let mut config = LinkConfig::default();
        device.reset(&config);
        assert_eq!(device.link_id(), link_id(&config));

        config.remote_port = "15200".into();
        device.reset(&config);
        assert_eq!(device.link_id(), link_id(&config));
    }

    #[test]
    fn ram_writes_are_masked_and_mirrored() {
        let mut device = LinkDevice::new();
        device.write_ram(0x0005, 0xffff);
        assert_eq!(device.read_ram(0x0005), 0x01ff);
        // the address wraps at the 13-bit window
        device.write_ram(0x2005, 0x0123);
        assert_eq!(device.read_ram(0x0005), 0x0123);
    }

    #[test]
    fn registers_are_mirrored_across_the_window() {
        let mut device = LinkDevice::new();
        device.write_reg(REG_TXOFFSET + 8, 0x0456);
        assert_eq!(device.read_reg(REG_TXOFFSET), 0x0456);
    }

    #[test]
    fn rxoffset_always_reads_with_the_high_bit_set() {
        let mut device = LinkDevice::new();
        device.write_reg(REG_RXOFFSET, 0x0123);
        assert_eq!(device.read_reg(REG_RXOFFSET), 0x1123);
    }

    #[test]
    fn status_write_clears_status_and_acks_the_interrupt() {
        let irq = RecordingIrq::default();
        let mut device = device_with(TestLink::online());
        device.connect_irq(Box::new(irq.clone()));

        // TXSIZE == 0 fires modes 8..=11
        device.regs[REG_MODE] = 0x08;
        device.tick();
        assert!(device.irq_asserted());
        assert_eq!(device.regs[REG_MODE], 0x000f);

        device.write_reg(REG_STATUS, 0x000f);
        assert!(!device.irq_asserted());
        assert_eq!(device.regs[REG_STATUS], 0);
        assert_eq!(*irq.0.lock().expect("edge lock"), vec![true, false]);
    }

    #[test]
    fn mode_policy_table_matches_the_hardware() {
        // (mode, rxsize, txsize, sync, asserts)
        let fixtures: &[(u16, u16, u16, bool, bool)] = &[
            (0x00, 0, 1, false, true),
            (0x00, 1, 0, false, true),
            (0x00, 1, 1, true, false),
            (0x01, 0, 1, false, true),
            (0x02, 1, 0, false, true),
            (0x03, 1, 1, true, false),
            (0x04, 0, 1, false, true),
            (0x04, 1, 1, true, true),
            (0x04, 1, 1, false, false),
            (0x05, 0, 0, false, true),
            (0x05, 1, 0, false, false),
            (0x06, 0, 0, false, true),
            (0x06, 1, 0, true, false),
            (0x07, 0, 1, false, true),
            (0x07, 1, 0, true, false),
            (0x08, 1, 0, false, true),
            (0x08, 0, 1, true, false),
            (0x09, 1, 0, false, true),
            (0x0a, 1, 1, true, false),
            (0x0b, 1, 0, false, true),
            (0x0c, 1, 1, true, true),
            (0x0c, 0, 0, false, false),
            (0x0d, 1, 1, true, true),
            (0x0d, 0, 0, false, false),
            (0x0e, 0, 0, true, false),
            (0x0f, 0, 0, true, false),
        ];

        for &(mode, rxsize, txsize, sync, asserts) in fixtures {
            let mut device = device_with(TestLink::online());
            device.regs[REG_MODE] = mode;
            device.regs[REG_RXSIZE] = rxsize;
            device.regs[REG_TXSIZE] = txsize;
            if sync {
                device.regs[REG_STATUS] |= STATUS_SYNC;
            }

            device.tick();
            assert_eq!(
                device.irq_asserted(),
                asserts,
                "mode {mode:02x} rx={rxsize} tx={txsize} sync={sync}"
            );
            if asserts {
                assert_eq!(device.regs[REG_MODE], 0x000f, "mode {mode:02x} must park");
            } else {
                assert_eq!(device.regs[REG_MODE], mode, "mode {mode:02x} must persist");
            }
        }
    }

    #[test]
    fn asserted_interrupt_holds_for_four_ticks() {
        let irq = RecordingIrq::default();
        let mut device = device_with(TestLink::online());
        device.connect_irq(Box::new(irq.clone()));
        device.regs[REG_MODE] = 0x08;

        device.tick();
        assert!(device.irq_asserted());

        // mode parked at 0x0f, so nothing re-asserts while the hold runs out
        for _ in 0..3 {
            device.tick();
            assert!(device.irq_asserted());
        }
        device.tick();
        assert!(!device.irq_asserted());
        assert_eq!(*irq.0.lock().expect("edge lock"), vec![true, false]);
    }

    #[test]
    fn transmit_packs_words_big_endian_with_trailer() {
        let link = TestLink::online();
        let mut device = device_with(link.clone());
        device.write_ram(0, 0x0105);
        device.write_ram(1, 0x0042);
        // sync-bit mode, sizes non-zero so no mode fires mid-test
        device.regs[REG_MODE] = 0x01;
        device.regs[REG_RXSIZE] = 2;
        device.regs[REG_TXSIZE] = 2;

        device.tick();

        let state = link.0.lock().expect("state lock");
        let frame = state.sent.first().expect("one frame sent");
        assert_eq!(frame.len(), FRAME_LEN);
        assert_eq!(&frame[..4], &[0x01, 0x05, 0x00, 0x42]);
        assert_eq!(frame[FRAME_LINK_ID], device.link_id());
        assert_eq!(frame[FRAME_WORD_COUNT], 2);
    }

    #[test]
    fn transmit_without_sync_bits_masks_words_and_marks_the_tail() {
        let link = TestLink::online();
        let mut device = device_with(link.clone());
        device.write_ram(0, 0x0105);
        device.write_ram(1, 0x0042);
        device.regs[REG_MODE] = 0x02;
        device.regs[REG_RXSIZE] = 2;
        device.regs[REG_TXSIZE] = 2;

        device.tick();

        let state = link.0.lock().expect("state lock");
        let frame = state.sent.first().expect("one frame sent");
        // words masked to their low byte, final byte carries the end marker
        assert_eq!(&frame[..4], &[0x00, 0x05, 0x00, 0x43]);
        assert_eq!(frame[FRAME_WORD_COUNT], 2);
    }

    #[test]
    fn transmit_reads_wrapped_offsets_from_ram() {
        let link = TestLink::online();
        let mut device = device_with(link.clone());
        device.write_ram(0x1fff, 0x0111);
        device.write_ram(0x0000, 0x0122);
        device.regs[REG_MODE] = 0x01;
        device.regs[REG_RXSIZE] = 2;
        device.regs[REG_TXSIZE] = 2;
        device.regs[REG_TXOFFSET] = 0x1fff;

        device.tick();

        let state = link.0.lock().expect("state lock");
        let frame = state.sent.first().expect("one frame sent");
        assert_eq!(&frame[..4], &[0x01, 0x11, 0x01, 0x22]);
    }

    #[test]
    fn halt_bit_blocks_transmission() {
        let link = TestLink::online();
        let mut device = device_with(link.clone());
        device.regs[REG_MODE] = 0x01;
        device.regs[REG_RXSIZE] = 1;
        device.regs[REG_TXSIZE] = 1;
        device.write_reg(REG_CONTROL, CONTROL_HALT);

        for _ in 0..8 {
            device.tick();
        }
        assert!(link.0.lock().expect("state lock").sent.is_empty());

        device.write_reg(REG_CONTROL, 0);
        device.tick();
        assert_eq!(link.0.lock().expect("state lock").sent.len(), 1);
    }

    #[test]
    fn txsize_write_blocks_transmission_for_the_programmed_ticks() {
        let link = TestLink::online();
        let mut device = device_with(link.clone());
        device.write_ram(0, 0x0101);
        device.write_ram(1, 0x0102);
        device.regs[REG_MODE] = 0x01;
        device.regs[REG_RXSIZE] = 2;
        device.write_reg(REG_TXSIZE, 2);

        // tx_block = 2 * 12 ticks before the frame may go out
        for _ in 0..23 {
            device.tick();
            assert!(link.0.lock().expect("state lock").sent.is_empty());
        }
        device.tick();
        assert_eq!(link.0.lock().expect("state lock").sent.len(), 1);
    }

    #[test]
    fn txsize_clears_once_the_transfer_delay_expires() {
        let link = TestLink::online();
        let mut device = device_with(link.clone());
        device.regs[REG_MODE] = 0x01;
        device.regs[REG_RXSIZE] = 2;
        device.regs[REG_TXSIZE] = 2;

        device.tick();
        assert_eq!(link.0.lock().expect("state lock").sent.len(), 1);
        assert_eq!(device.regs[REG_TXSIZE], 2);

        // 2 words * 12 ticks of line time before the host sees completion
        for _ in 0..23 {
            device.tick();
        }
        assert_eq!(device.regs[REG_TXSIZE], 2);
        device.tick();
        assert_eq!(device.regs[REG_TXSIZE], 0);
        assert_ne!(device.read_reg(REG_STATUS) & STATUS_TX_IDLE, 0);
        // only the one frame went out
        assert_eq!(link.0.lock().expect("state lock").sent.len(), 1);
    }

    #[test]
    fn rejected_sends_are_retried_until_the_link_accepts() {
        let link = TestLink::online();
        link.0.lock().expect("state lock").reject_sends = true;
        let mut device = device_with(link.clone());
        device.regs[REG_MODE] = 0x01;
        device.regs[REG_RXSIZE] = 1;
        device.regs[REG_TXSIZE] = 1;

        device.tick();
        device.tick();
        {
            let state = link.0.lock().expect("state lock");
            assert_eq!(state.attempts, 2);
            assert!(state.sent.is_empty());
        }
        // TXSIZE must not complete while the frame keeps getting dropped
        assert_eq!(device.regs[REG_TXSIZE], 1);

        link.0.lock().expect("state lock").reject_sends = false;
        device.tick();
        assert_eq!(link.0.lock().expect("state lock").sent.len(), 1);
        for _ in 0..12 {
            device.tick();
        }
        assert_eq!(device.regs[REG_TXSIZE], 0);
    }

    #[test]
    fn receive_unpacks_words_into_the_upper_ram_half() {
        let link = TestLink::online();
        link.queue_frame(&[0x0100, 0x0002, 0x0003], 3);
        let mut device = device_with(link.clone());
        device.regs[REG_RXSIZE] = 3;
        device.regs[REG_RXOFFSET] = 0;

        device.tick();

        assert_eq!(device.read_ram(0x1000), 0x0100);
        assert_eq!(device.read_ram(0x1001), 0x0002);
        assert_eq!(device.read_ram(0x1002), 0x0003);
        // the first word carried the sync bit
        assert_ne!(device.regs[REG_STATUS] & STATUS_SYNC, 0);
        assert_eq!(device.regs[REG_RXSIZE], 0);
        assert_eq!(device.regs[REG_RXOFFSET], 3);
        assert_eq!(device.read_reg(REG_RXOFFSET), 0x1003);
    }

    #[test]
    fn receive_throttles_the_next_frame_by_the_word_count() {
        let link = TestLink::online();
        link.queue_frame(&[0x0001, 0x0002, 0x0003], 3);
        link.queue_frame(&[0x0004], 1);
        let mut device = device_with(link.clone());
        device.regs[REG_RXSIZE] = 4;

        device.tick();
        assert_eq!(device.read_ram(0x1002), 0x0003);

        // 3 words * 12 ticks before the second frame may be consumed
        for _ in 0..35 {
            device.tick();
        }
        assert_eq!(device.read_ram(0x1003), 0x0000);
        device.tick();
        assert_eq!(device.read_ram(0x1003), 0x0004);
        assert_eq!(device.regs[REG_RXSIZE], 0);
    }

    #[test]
    fn receive_offset_wraps_inside_the_upper_half() {
        let link = TestLink::online();
        link.queue_frame(&[0x0011, 0x0022], 2);
        let mut device = device_with(link.clone());
        device.regs[REG_RXSIZE] = 2;
        device.regs[REG_RXOFFSET] = 0x0fff;

        device.tick();

        assert_eq!(device.read_ram(0x1fff), 0x0011);
        assert_eq!(device.read_ram(0x1000), 0x0022);
        assert_eq!(device.regs[REG_RXOFFSET], 0x0001);
    }

    #[test]
    fn zero_count_frame_is_a_keepalive() {
        let link = TestLink::online();
        link.queue_frame(&[], 0);
        let mut device = device_with(link.clone());
        device.regs[REG_RXSIZE] = 2;

        device.tick();

        // the frame was consumed without touching the sizes or RAM
        assert_eq!(link.0.lock().expect("state lock").incoming.len(), 0);
        assert_eq!(device.regs[REG_RXSIZE], 2);
        assert_eq!(device.read_ram(0x1000), 0);
    }

    #[test]
    fn loopback_null_link_round_trips_a_transfer() {
        let mut device = LinkDevice::new();
        device.connect_link(Box::new(NullFrameLink::new(true)));
        device.reset(&LinkConfig::default());

        device.write_ram(0, 0x0155);
        device.write_ram(1, 0x00aa);
        device.regs[REG_MODE] = 0x01;
        device.regs[REG_RXSIZE] = 2;
        device.regs[REG_TXSIZE] = 2;

        // first tick transmits; the receive pass of the same tick already
        // sees the looped-back frame
        device.tick();

        assert_eq!(device.read_ram(0x1000), 0x0155);
        assert_eq!(device.read_ram(0x1001), 0x00aa);
        assert_eq!(device.regs[REG_RXSIZE], 0);
    }
}
