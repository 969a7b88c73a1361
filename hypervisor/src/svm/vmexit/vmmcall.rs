//! Hypercall dispatch. The guest issues VMMCALL with the call number in
//! RAX. Unknown numbers are logged and ignored; a guest experimenting with
//! hypercalls is not a containment failure.

use super::ExitType;
use crate::svm::vcpu::VirtualCpu;

const BANNER: &str = r"
 _  _  _     _  _
| \| |(_) __| || |_   ___  __ _  __ _
| .` || |/ _` ||   \ / _ \/ _` |/ _` |
|_|\_||_|\__,_||_||_|\___/\__, |\__, |
                          |___/ |___/
";

/// Print the hypervisor banner.
const NR_HELLO: u64 = 0;

pub fn handle(vcpu: &mut VirtualCpu) -> ExitType {
    match vcpu.vmcb().save_area.rax {
        NR_HELLO => {
            log::info!("GREETINGS FROM THE VMM...\n{}", BANNER);
            log::info!("This OS is virtualized by Nidhogg.");
        }
        nr => log::error!("unhandled VMMCALL: nr={}", nr),
    }

    ExitType::IncrementRip
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svm::vcpu::tests::test_vcpu;

    #[test]
    fn unknown_hypercalls_are_not_fatal() {
        let mut vcpu = test_vcpu();
        vcpu.vmcb_mut().save_area.rax = 0x1337;
        assert_eq!(handle(&mut vcpu), ExitType::IncrementRip);
    }

    #[test]
    fn hello_advances_rip() {
        let mut vcpu = test_vcpu();
        vcpu.vmcb_mut().save_area.rax = NR_HELLO;
        assert_eq!(handle(&mut vcpu), ExitType::IncrementRip);
    }
}
