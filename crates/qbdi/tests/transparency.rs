//! A guest `ret` must resume the host exactly where the guest stack
//! says to, with GPR state faithfully readable afterward — the minimal
//! end-to-end check that the prologue/epilogue pair and the
//! `NextInstId` resume bridge agree with each other.

mod common;

use common::{GuestCode, GuestStack};
use qbdi::{GPRState, VMConfig, VM};

#[test]
fn ret_resumes_at_the_stacked_return_address_with_rax_intact() {
    // movabs rax, 0xdead; ret
    let code = [0x48, 0xB8, 0xAD, 0xDE, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xC3];
    let guest_code = GuestCode::map(&code);
    let guest_stack = GuestStack::new();

    let sentinel_return: u64 = 0x4141_4141_4242_4242;
    let sp = guest_stack.top() - 8;
    guest_stack.write_u64(sp, sentinel_return);

    let mut vm = VM::new(VMConfig::default());
    vm.add_instrumented_range(guest_code.addr(), guest_code.end());
    let mut gpr = GPRState::default();
    gpr.rsp = sp;
    vm.set_gpr_state(gpr);

    let reached_stop = vm.run(guest_code.addr(), sentinel_return).unwrap();

    assert!(reached_stop);
    assert_eq!(vm.gpr_state().gpr[0], 0xdead);
}
