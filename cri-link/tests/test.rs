use std::sync::{
    Arc,
    Mutex,
};
use std::thread;
use std::time::Duration;

use crossbeam_channel::unbounded;

use cri_lib::ThreadControl;
use cri_link::memory::SimBar;
use cri_link::monitoring::monitor_links;
use cri_link::prelude::*;
use cri_link::registers::*;

const DATA_ADDR : u64 = 0x1_0000_0000;
const DESC_ADDR : u64 = 0x1_0001_0000;

fn data_buffer() -> DmaBuffer {
  DmaBuffer::new(DATA_ADDR, 16)
}

fn desc_buffer() -> DmaBuffer {
  DmaBuffer::new(DESC_ADDR, 10)
}

fn dma_ctrl(link_index : usize) -> usize {
  pkt_base_addr(link_index) + REG_DMA_CTRL
}

fn enable_bit_set(sim : &SimBar, link_index : usize) -> bool {
  sim.peek_reg(dma_ctrl(link_index)) & (1 << DMA_CTRL_ENABLE_BIT) != 0
}

#[test]
fn dma_channel_lifecycle() {
  let (dev, sim) = CriDevice::simulated(2);
  let mut link = dev.link(1).unwrap();
  assert!(!link.has_dma());
  assert_eq!(link.dma().err(), Some(CriError::NoDmaChannel));

  link.init_dma(data_buffer(), desc_buffer()).unwrap();
  assert!(link.has_dma());
  assert!(enable_bit_set(&sim, 1));
  assert!(!enable_bit_set(&sim, 0));
  let base = pkt_base_addr(1);
  assert_eq!(sim.peek_reg(base + REG_EBDM_BUFFER_ADDR_L), 0x0000_0000);
  assert_eq!(sim.peek_reg(base + REG_EBDM_BUFFER_ADDR_H), 0x0000_0001);
  assert_eq!(sim.peek_reg(base + REG_EBDM_BUFFER_LOG_SIZE), 16);
  assert_eq!(sim.peek_reg(base + REG_RBDM_BUFFER_ADDR_L), 0x0001_0000);
  assert_eq!(sim.peek_reg(base + REG_RBDM_BUFFER_LOG_SIZE), 10);
  assert_eq!(sim.peek_reg(base + REG_DMA_TRANSFER_SIZE), 32);
  {
    let channel = link.dma().unwrap();
    assert_eq!(channel.link_index(), 1);
    assert_eq!(channel.data_buffer(), data_buffer());
    assert_eq!(channel.desc_buffer(), desc_buffer());
    assert!(channel.is_enabled().unwrap());
  }

  link.deinit_dma();
  assert!(!link.has_dma());
  assert!(!enable_bit_set(&sim, 1));
  assert_eq!(link.dma().err(), Some(CriError::NoDmaChannel));
  // a second teardown is a no-op
  sim.clear_journal();
  link.deinit_dma();
  assert!(sim.journal().is_empty());
}

#[test]
fn init_dma_replaces_active_channel() {
  let (dev, sim) = CriDevice::simulated(1);
  let mut link = dev.link(0).unwrap();
  link.init_dma(data_buffer(), desc_buffer()).unwrap();
  link.init_dma(DmaBuffer::new(0x2_0000_0000, 20), desc_buffer()).unwrap();
  // arm (fifo pulse, enable), disarm (enable off, fifo pulse), arm again
  assert_eq!(sim.writes_to(dma_ctrl(0)), vec![0x2, 0x1, 0x0, 0x2, 0x2, 0x1]);
  assert!(enable_bit_set(&sim, 0));
  assert_eq!(link.dma().unwrap().data_buffer().log_size, 20);
  assert_eq!(sim.peek_reg(pkt_base_addr(0) + REG_EBDM_BUFFER_ADDR_H), 0x2);
}

#[test]
fn failed_init_leaves_engine_disarmed() {
  let (dev, sim) = CriDevice::simulated(1);
  let mut link = dev.link(0).unwrap();
  // everything up to the enable bit goes through
  sim.fail_writes_after(Some(12));
  let res = link.init_dma(data_buffer(), desc_buffer());
  assert_eq!(res, Err(CriError::Register(RegisterError::WriteFault)));
  assert!(!res.unwrap_err().is_usage_error());
  assert!(!link.has_dma());
  assert!(!enable_bit_set(&sim, 0));
  sim.fail_writes_after(None);
  link.init_dma(data_buffer(), desc_buffer()).unwrap();
  assert!(enable_bit_set(&sim, 0));
}

#[test]
fn invalid_buffers_touch_no_register() {
  let (dev, sim) = CriDevice::simulated(1);
  let mut link = dev.link(0).unwrap();
  sim.clear_journal();
  let cases = [
    (data_buffer(), DmaBuffer::new(DATA_ADDR + 0x8000, 10), CriError::BufferOverlap),
    (DmaBuffer::new(DATA_ADDR + 0x40, 16), desc_buffer(), CriError::MisalignedBuffer(DATA_ADDR + 0x40)),
    (data_buffer(), DmaBuffer::new(DESC_ADDR, 6), CriError::InvalidBufferLogSize(6)),
    (DmaBuffer::new(DATA_ADDR, 48), desc_buffer(), CriError::InvalidBufferLogSize(48)),
  ];
  for (data, desc, expected) in cases {
    let err = link.init_dma(data, desc).unwrap_err();
    assert_eq!(err, expected);
    assert!(err.is_usage_error());
    assert!(!link.has_dma());
  }
  assert!(sim.journal().is_empty());
}

#[test]
fn invalid_buffers_keep_running_channel() {
  let (dev, sim) = CriDevice::simulated(1);
  let mut link = dev.link(0).unwrap();
  link.init_dma(data_buffer(), desc_buffer()).unwrap();
  sim.clear_journal();
  let err = link.init_dma(data_buffer(), DmaBuffer::new(DATA_ADDR + 0x8000, 10)).unwrap_err();
  assert_eq!(err, CriError::BufferOverlap);
  assert!(link.has_dma());
  assert!(enable_bit_set(&sim, 0));
  assert_eq!(link.dma().unwrap().data_buffer(), data_buffer());
  assert!(sim.journal().is_empty());
}

#[test]
fn stale_engine_can_be_forced_off() {
  let (dev, sim) = CriDevice::simulated(1);
  let mut crashed = dev.link(0).unwrap();
  crashed.init_dma(data_buffer(), desc_buffer()).unwrap();
  // the owner goes away without tearing down
  std::mem::forget(crashed);

  let mut link = dev.link(0).unwrap();
  assert_eq!(link.init_dma(data_buffer(), desc_buffer()), Err(CriError::DmaEngineBusy));
  link.deinit_dma();
  assert!(enable_bit_set(&sim, 0));

  link.force_disarm_dma().unwrap();
  assert!(!enable_bit_set(&sim, 0));
  link.init_dma(data_buffer(), desc_buffer()).unwrap();
  assert!(link.has_dma());

  // also drops our own channel
  link.force_disarm_dma().unwrap();
  assert!(!link.has_dma());
  assert!(!enable_bit_set(&sim, 0));
}

#[test]
fn engine_in_use_is_not_taken_over() {
  let (dev, sim) = CriDevice::simulated(1);
  let mut link = dev.link(0).unwrap();
  sim.poke_reg(dma_ctrl(0), 1 << DMA_CTRL_ENABLE_BIT);
  assert_eq!(link.init_dma(data_buffer(), desc_buffer()), Err(CriError::DmaEngineBusy));
  assert!(!link.has_dma());
  assert!(sim.journal().is_empty());
  // the other session keeps running
  drop(link);
  assert!(enable_bit_set(&sim, 0));
}

#[test]
fn busy_engine_is_disarmed_after_timeout() {
  let (dev, sim) = CriDevice::simulated(1);
  let mut link = dev.link(0).unwrap();
  link.init_dma(data_buffer(), desc_buffer()).unwrap();
  sim.poke_reg(dma_ctrl(0), (1 << DMA_CTRL_BUSY_BIT) | (1 << DMA_CTRL_ENABLE_BIT));
  assert!(link.dma().unwrap().is_busy().unwrap());
  link.deinit_dma();
  assert!(!enable_bit_set(&sim, 0));
}

#[test]
fn dropping_the_link_disarms_the_engine() {
  let (dev, sim) = CriDevice::simulated(3);
  let mut link = dev.link(2).unwrap();
  link.init_dma(data_buffer(), desc_buffer()).unwrap();
  assert!(enable_bit_set(&sim, 2));
  drop(link);
  assert!(!enable_bit_set(&sim, 2));
}

#[test]
fn link_outliving_the_device() {
  let (dev, sim) = CriDevice::simulated(1);
  let mut link = dev.link(0).unwrap();
  link.init_dma(data_buffer(), desc_buffer()).unwrap();
  drop(dev);
  drop(sim);
  assert_eq!(link.dma().unwrap().is_enabled(), Err(CriError::Register(RegisterError::Detached)));
  // must not panic
  link.deinit_dma();
  assert!(!link.has_dma());
}

#[test]
fn hardware_write_pointers_are_masked() {
  let (dev, sim) = CriDevice::simulated(1);
  let mut link = dev.link(0).unwrap();
  link.init_dma(data_buffer(), desc_buffer()).unwrap();
  let base = pkt_base_addr(0);
  sim.poke_reg(base + REG_EBDM_HW_WRITE_POINTER_L, 0x0001_0080);
  sim.poke_reg(base + REG_EBDM_HW_WRITE_POINTER_H, 0x1);
  sim.poke_reg(base + REG_RBDM_HW_WRITE_POINTER_L, 0x440);
  let channel = link.dma().unwrap();
  assert_eq!(channel.data_offset().unwrap(), 0x80);
  assert_eq!(channel.desc_index().unwrap(), 2);
}

#[test]
fn software_read_pointers() {
  let (dev, sim) = CriDevice::simulated(1);
  let mut link = dev.link(0).unwrap();
  link.init_dma(data_buffer(), desc_buffer()).unwrap();
  let base = pkt_base_addr(0);
  let channel = link.dma_mut().unwrap();
  for (data, desc) in [(0x1_0000, 0), (100, 0), (0, 1024), (0, 33)] {
    let err = channel.set_sw_read_pointers(data, desc).unwrap_err();
    assert!(err.is_usage_error());
  }
  channel.set_sw_read_pointers(0xFF80, 0x3E0).unwrap();
  assert_eq!(sim.peek_reg(base + REG_EBDM_SW_READ_POINTER_L), 0xFF80);
  assert_eq!(sim.peek_reg(base + REG_EBDM_SW_READ_POINTER_H), 0);
  assert_eq!(sim.peek_reg(base + REG_RBDM_SW_READ_POINTER_L), 0x3E0);
}

#[test]
fn dma_calls_without_channel() {
  let (dev, _sim) = CriDevice::simulated(1);
  let mut link = dev.link(0).unwrap();
  assert_eq!(link.dma_mut().err(), Some(CriError::NoDmaChannel));
  assert!(CriError::NoDmaChannel.is_usage_error());
}

#[test]
fn monitoring_sends_one_metric_per_link() {
  let (dev, sim) = CriDevice::simulated(2);
  sim.poke_reg(pkt_base_addr(0) + REG_PERF_N_EVENTS, 7);
  sim.poke_reg(pkt_base_addr(1) + REG_PERF_N_EVENTS, 9);
  let links = dev.links().unwrap();
  let thread_control = Arc::new(Mutex::new(ThreadControl::new()));
  let (tx, rx) = unbounded::<LinkPerfMetric>();
  thread::scope(|s| {
    let tc = Arc::clone(&thread_control);
    let links_ref = &links;
    let handle = s.spawn(move || monitor_links(links_ref, &tx, Duration::from_secs(60), false, tc));
    let first  = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!((first.link_index, first.perf.events), (0, 7));
    assert_eq!((second.link_index, second.perf.events), (1, 9));
    thread_control.lock().unwrap().stop_flag = true;
    handle.join().unwrap();
  });
  let tc = thread_control.lock().unwrap();
  assert_eq!(tc.n_moni_sent, 2);
  assert!(!tc.thread_monitoring_active);
}
