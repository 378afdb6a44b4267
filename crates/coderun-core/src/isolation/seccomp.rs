//! Seccomp-BPF syscall denylist
//!
//! Submissions are ordinary programs built by stock toolchains, so the filter
//! denies the syscalls that administer the host or escape confinement and
//! lets everything else through. Denied calls fail with EPERM instead of
//! killing the process, which keeps runtimes that test for features alive.
//!
//! Programs get no network: `socket` is refused for the internet and packet
//! families, and io_uring, which can open sockets on its own, is refused
//! outright. Unix sockets and socketpairs still work.

use seccompiler::{
    BpfProgram, SeccompAction, SeccompCmpArgLen, SeccompCmpOp, SeccompCondition, SeccompFilter,
    SeccompRule, TargetArch,
};
use std::collections::BTreeMap;

use crate::{CoderunError, Result};

/// Syscalls no submission may issue
const DENIED_SYSCALLS: &[i64] = &[
    libc::SYS_ptrace,
    libc::SYS_mount,
    libc::SYS_umount2,
    libc::SYS_pivot_root,
    libc::SYS_chroot,
    libc::SYS_unshare,
    libc::SYS_setns,
    libc::SYS_reboot,
    libc::SYS_kexec_load,
    libc::SYS_init_module,
    libc::SYS_finit_module,
    libc::SYS_delete_module,
    libc::SYS_bpf,
    libc::SYS_perf_event_open,
    libc::SYS_add_key,
    libc::SYS_request_key,
    libc::SYS_keyctl,
    libc::SYS_swapon,
    libc::SYS_swapoff,
    libc::SYS_process_vm_readv,
    libc::SYS_process_vm_writev,
    libc::SYS_open_by_handle_at,
    libc::SYS_userfaultfd,
    libc::SYS_acct,
    libc::SYS_settimeofday,
    libc::SYS_clock_settime,
    libc::SYS_sethostname,
    libc::SYS_setdomainname,
    libc::SYS_quotactl,
    libc::SYS_io_uring_setup,
    libc::SYS_io_uring_enter,
    libc::SYS_io_uring_register,
];

/// Socket families that reach a network
const NETWORK_FAMILIES: &[libc::c_int] = &[libc::AF_INET, libc::AF_INET6, libc::AF_PACKET];

/// One rule per network family, matched on the first `socket` argument
fn socket_rules() -> Result<Vec<SeccompRule>> {
    NETWORK_FAMILIES
        .iter()
        .map(|&family| {
            let condition = SeccompCondition::new(
                0,
                SeccompCmpArgLen::Dword,
                SeccompCmpOp::Eq,
                u64::from(family.unsigned_abs()),
            )
            .map_err(|e| CoderunError::Seccomp(format!("bad socket condition: {e}")))?;
            SeccompRule::new(vec![condition])
                .map_err(|e| CoderunError::Seccomp(format!("bad socket rule: {e}")))
        })
        .collect()
}

/// Compile the denylist for the running architecture
pub fn build_denylist() -> Result<BpfProgram> {
    let arch: TargetArch = std::env::consts::ARCH
        .try_into()
        .map_err(|e| CoderunError::Seccomp(format!("unsupported architecture: {e:?}")))?;

    let mut rules: BTreeMap<i64, Vec<SeccompRule>> = DENIED_SYSCALLS
        .iter()
        .map(|&nr| (nr, Vec::new()))
        .collect();
    rules.insert(libc::SYS_socket, socket_rules()?);

    let filter = SeccompFilter::new(
        rules,
        SeccompAction::Allow,
        SeccompAction::Errno(libc::EPERM.unsigned_abs()),
        arch,
    )
    .map_err(|e| CoderunError::Seccomp(format!("failed to build filter: {e}")))?;

    let program: BpfProgram = filter
        .try_into()
        .map_err(|e| CoderunError::Seccomp(format!("failed to compile filter: {e}")))?;

    tracing::debug!(denied = DENIED_SYSCALLS.len(), instructions = program.len(), "seccomp filter compiled");
    Ok(program)
}

/// Load `program` into the calling thread
///
/// Sets `no_new_privs` as a side effect.
pub(crate) fn install(program: &BpfProgram) -> std::io::Result<()> {
    seccompiler::apply_filter(program).map_err(|e| std::io::Error::other(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denylist_compiles_for_host() {
        let program = build_denylist().unwrap();
        assert!(!program.is_empty());
    }

    #[test]
    fn denylist_has_no_duplicates() {
        let mut seen = DENIED_SYSCALLS.to_vec();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), DENIED_SYSCALLS.len());
        assert!(!seen.contains(&libc::SYS_socket));
    }

    #[test]
    fn network_sockets_are_refused() {
        let program = build_denylist().unwrap();

        // Filters bind to the installing thread only
        std::thread::spawn(move || {
            install(&program).unwrap();

            let err = std::net::TcpListener::bind("127.0.0.1:0").unwrap_err();
            assert_eq!(err.raw_os_error(), Some(libc::EPERM));
            let err = std::net::UdpSocket::bind("[::1]:0").unwrap_err();
            assert_eq!(err.raw_os_error(), Some(libc::EPERM));

            std::os::unix::net::UnixDatagram::unbound().unwrap();
            std::os::unix::net::UnixStream::pair().unwrap();
        })
        .join()
        .unwrap();
    }
}
