//! `recordMemoryAccess` must capture the real address, size and value of
//! a guest load, not just a recognizable shape.

mod common;

use common::{GuestCode, GuestStack};
use qbdi::{GPRState, MemoryAccessKind, VMConfig, VM};

#[test]
fn read_access_is_recorded_with_its_real_value_and_size() {
    // mov rax, [rsi]; ret
    let code = [0x48, 0x8B, 0x06, 0xC3];
    let guest_code = GuestCode::map(&code);
    let guest_stack = GuestStack::new();

    let watched: Box<u64> = Box::new(0x42);
    let watched_addr = &*watched as *const u64 as u64;

    let mut vm = VM::new(VMConfig::default());
    vm.add_instrumented_range(guest_code.addr(), guest_code.end());
    vm.record_memory_access(true, false);

    let mut gpr = GPRState::default();
    gpr.gpr[5] = watched_addr; // rsi, per GPR_ID's ordering
    gpr.rsp = guest_stack.top();
    vm.set_gpr_state(gpr);

    // The recorded access's callback fires before the `ret` behind it
    // ever runs, so the resume slot this single pass leaves behind is
    // the data page's untouched zero default rather than a real guest
    // address — stopping at 0 is what lets this run return cleanly
    // after exactly the one access we came here to observe.
    let reached_stop = vm.run(guest_code.addr(), 0).unwrap();
    assert!(reached_stop);

    let access = vm.get_inst_memory_access().expect("memory access was not recorded");
    assert_eq!(access.access_address, watched_addr);
    assert_eq!(access.size, 8);
    assert_eq!(access.value, 0x42);
    assert_eq!(access.kind, MemoryAccessKind::Read);
}
