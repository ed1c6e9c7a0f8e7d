//! Seccomp filter synthesis.
//!
//! Compiles a deny-by-default syscall filter from the resolved
//! configuration. The baseline allow-list covers what any desktop
//! process needs to start and run; every additional syscall group must be
//! justified by an enabled service through the contribution table below.
//! A syscall the synthesizer cannot justify is never allowed — unknown
//! syscalls fall through to the default `errno(EPERM)` action.
//!
//! # Nested namespace restriction
//!
//! The sandbox itself runs inside fresh namespaces, so the kernel would
//! happily let it create more. `clone` is therefore allowed only with all
//! `CLONE_NEW*` bits clear, and `unshare`/`setns`/`clone3` are not in the
//! allow-list at all. Services that would need nested namespace creation
//! must add an explicit entry here; none of the current set does.
//!
//! Rule ordering: argument-conditioned rules are emitted before (and
//! instead of) unconditioned ones for the same syscall, so the most
//! specific match always decides.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::os::fd::OwnedFd;

use seccompiler::{
    BpfProgram, SeccompAction, SeccompCmpArgLen, SeccompCmpOp, SeccompCondition, SeccompFilter,
    SeccompRule, TargetArch,
};
use tracing::{debug, instrument, trace};

use crate::error::SeccompError;
use crate::service::{ResolvedConfig, Service};

/// All namespace-creating clone flags.
const CLONE_NEW_MASK: u64 = (libc::CLONE_NEWUSER
    | libc::CLONE_NEWNS
    | libc::CLONE_NEWPID
    | libc::CLONE_NEWNET
    | libc::CLONE_NEWIPC
    | libc::CLONE_NEWUTS
    | libc::CLONE_NEWCGROUP) as u64;

/// Syscalls every sandboxed process may use, regardless of services.
const BASELINE_SYSCALLS: &[(&str, i64)] = &[
    ("read", libc::SYS_read),
    ("write", libc::SYS_write),
    ("readv", libc::SYS_readv),
    ("writev", libc::SYS_writev),
    ("pread64", libc::SYS_pread64),
    ("pwrite64", libc::SYS_pwrite64),
    ("openat", libc::SYS_openat),
    ("close", libc::SYS_close),
    ("fstat", libc::SYS_fstat),
    ("newfstatat", libc::SYS_newfstatat),
    ("statx", libc::SYS_statx),
    ("lseek", libc::SYS_lseek),
    ("mmap", libc::SYS_mmap),
    ("mprotect", libc::SYS_mprotect),
    ("munmap", libc::SYS_munmap),
    ("mremap", libc::SYS_mremap),
    ("madvise", libc::SYS_madvise),
    ("brk", libc::SYS_brk),
    ("rt_sigaction", libc::SYS_rt_sigaction),
    ("rt_sigprocmask", libc::SYS_rt_sigprocmask),
    ("rt_sigreturn", libc::SYS_rt_sigreturn),
    ("sigaltstack", libc::SYS_sigaltstack),
    ("ioctl", libc::SYS_ioctl),
    ("fcntl", libc::SYS_fcntl),
    ("dup", libc::SYS_dup),
    ("dup3", libc::SYS_dup3),
    ("pipe2", libc::SYS_pipe2),
    ("getdents64", libc::SYS_getdents64),
    ("getcwd", libc::SYS_getcwd),
    ("chdir", libc::SYS_chdir),
    ("mkdirat", libc::SYS_mkdirat),
    ("unlinkat", libc::SYS_unlinkat),
    ("renameat", libc::SYS_renameat),
    ("symlinkat", libc::SYS_symlinkat),
    ("readlinkat", libc::SYS_readlinkat),
    ("faccessat", libc::SYS_faccessat),
    ("fchmod", libc::SYS_fchmod),
    ("fchmodat", libc::SYS_fchmodat),
    ("fchownat", libc::SYS_fchownat),
    ("ftruncate", libc::SYS_ftruncate),
    ("fallocate", libc::SYS_fallocate),
    ("fsync", libc::SYS_fsync),
    ("fdatasync", libc::SYS_fdatasync),
    ("statfs", libc::SYS_statfs),
    ("fstatfs", libc::SYS_fstatfs),
    ("flock", libc::SYS_flock),
    ("umask", libc::SYS_umask),
    ("futex", libc::SYS_futex),
    ("get_robust_list", libc::SYS_get_robust_list),
    ("set_robust_list", libc::SYS_set_robust_list),
    ("set_tid_address", libc::SYS_set_tid_address),
    ("rseq", libc::SYS_rseq),
    ("sched_yield", libc::SYS_sched_yield),
    ("sched_getaffinity", libc::SYS_sched_getaffinity),
    ("getpid", libc::SYS_getpid),
    ("gettid", libc::SYS_gettid),
    ("getppid", libc::SYS_getppid),
    ("getuid", libc::SYS_getuid),
    ("geteuid", libc::SYS_geteuid),
    ("getgid", libc::SYS_getgid),
    ("getegid", libc::SYS_getegid),
    ("getgroups", libc::SYS_getgroups),
    ("getrandom", libc::SYS_getrandom),
    ("clock_gettime", libc::SYS_clock_gettime),
    ("clock_getres", libc::SYS_clock_getres),
    ("clock_nanosleep", libc::SYS_clock_nanosleep),
    ("nanosleep", libc::SYS_nanosleep),
    ("gettimeofday", libc::SYS_gettimeofday),
    ("uname", libc::SYS_uname),
    ("sysinfo", libc::SYS_sysinfo),
    ("getrusage", libc::SYS_getrusage),
    ("getrlimit", libc::SYS_getrlimit),
    ("prlimit64", libc::SYS_prlimit64),
    ("prctl", libc::SYS_prctl),
    ("capget", libc::SYS_capget),
    ("execve", libc::SYS_execve),
    ("execveat", libc::SYS_execveat),
    ("wait4", libc::SYS_wait4),
    ("waitid", libc::SYS_waitid),
    ("exit", libc::SYS_exit),
    ("exit_group", libc::SYS_exit_group),
    ("kill", libc::SYS_kill),
    ("tgkill", libc::SYS_tgkill),
    ("eventfd2", libc::SYS_eventfd2),
    ("timerfd_create", libc::SYS_timerfd_create),
    ("timerfd_settime", libc::SYS_timerfd_settime),
    ("epoll_create1", libc::SYS_epoll_create1),
    ("epoll_ctl", libc::SYS_epoll_ctl),
    ("epoll_pwait", libc::SYS_epoll_pwait),
    ("ppoll", libc::SYS_ppoll),
    ("pselect6", libc::SYS_pselect6),
    ("memfd_create", libc::SYS_memfd_create),
    ("inotify_init1", libc::SYS_inotify_init1),
    ("inotify_add_watch", libc::SYS_inotify_add_watch),
    ("inotify_rm_watch", libc::SYS_inotify_rm_watch),
    ("sendmsg", libc::SYS_sendmsg),
    ("recvmsg", libc::SYS_recvmsg),
    ("sendto", libc::SYS_sendto),
    ("recvfrom", libc::SYS_recvfrom),
    ("shutdown", libc::SYS_shutdown),
    ("getsockname", libc::SYS_getsockname),
    ("getsockopt", libc::SYS_getsockopt),
    ("setsockopt", libc::SYS_setsockopt),
    ("connect", libc::SYS_connect),
    ("bind", libc::SYS_bind),
];

/// Legacy x86_64-only syscalls still used by common runtimes.
#[cfg(target_arch = "x86_64")]
const ARCH_SYSCALLS: &[(&str, i64)] = &[
    ("open", libc::SYS_open),
    ("stat", libc::SYS_stat),
    ("lstat", libc::SYS_lstat),
    ("access", libc::SYS_access),
    ("readlink", libc::SYS_readlink),
    ("mkdir", libc::SYS_mkdir),
    ("unlink", libc::SYS_unlink),
    ("rename", libc::SYS_rename),
    ("chmod", libc::SYS_chmod),
    ("dup2", libc::SYS_dup2),
    ("pipe", libc::SYS_pipe),
    ("poll", libc::SYS_poll),
    ("select", libc::SYS_select),
    ("epoll_wait", libc::SYS_epoll_wait),
    ("arch_prctl", libc::SYS_arch_prctl),
];

#[cfg(not(target_arch = "x86_64"))]
const ARCH_SYSCALLS: &[(&str, i64)] = &[];

/// Syscalls granted only when a network service shares the host network.
const NETWORK_SYSCALLS: &[(&str, i64)] = &[
    ("listen", libc::SYS_listen),
    ("accept4", libc::SYS_accept4),
    ("getpeername", libc::SYS_getpeername),
    ("sendmmsg", libc::SYS_sendmmsg),
    ("recvmmsg", libc::SYS_recvmmsg),
];

/// How one rule decides: unconditionally, or only for matching arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RuleCondition {
    Always,
    /// `(arg[index] & mask) == value`
    ArgMaskedEq { index: u8, mask: u64, value: u64 },
    /// `arg[index] == value`
    ArgEq { index: u8, value: u64 },
}

/// One allow rule with its provenance, kept for auditability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyscallRule {
    /// Human-readable syscall name.
    pub name: &'static str,
    /// Syscall number on the target architecture.
    pub number: i64,
    /// Which part of the configuration justified the rule.
    pub origin: &'static str,
    condition: RuleCondition,
}

/// A compiled syscall filter plus the rule set it was built from.
///
/// Built fresh for every launch: service composition determines the
/// allowed syscall set, and instance overrides may have changed between
/// launches.
#[derive(Debug, Clone)]
pub struct SeccompProgram {
    rules: Vec<SyscallRule>,
    program: BpfProgram,
}

impl SeccompProgram {
    /// The ordered rule set, with provenance.
    #[must_use]
    pub fn rules(&self) -> &[SyscallRule] {
        &self.rules
    }

    /// The compiled BPF instructions.
    #[must_use]
    pub fn program(&self) -> &BpfProgram {
        &self.program
    }

    /// True if a rule for this syscall name exists.
    #[must_use]
    pub fn allows(&self, name: &str) -> bool {
        self.rules.iter().any(|rule| rule.name == name)
    }

    /// Raw bytes of the BPF program, as the kernel consumes them.
    #[must_use]
    pub fn as_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.program.len() * 8);
        for insn in &self.program {
            bytes.extend_from_slice(&insn.code.to_ne_bytes());
            bytes.push(insn.jt);
            bytes.push(insn.jf);
            bytes.extend_from_slice(&insn.k.to_ne_bytes());
        }
        bytes
    }

    /// Writes the program into a sealed memfd for descriptor inheritance.
    ///
    /// The containment primitive reads the filter from the descriptor, so
    /// the offset is rewound after writing and the contents are sealed
    /// against further modification.
    pub fn into_memfd(&self) -> Result<OwnedFd, SeccompError> {
        let name = CString::new("nestbox-seccomp").expect("static name has no NUL");
        // SAFETY: plain syscall; the returned descriptor is immediately
        // taken into ownership.
        let raw = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_ALLOW_SEALING) };
        if raw == -1 {
            return Err(SeccompError::Export {
                context: "memfd_create failed".to_string(),
                source: std::io::Error::last_os_error(),
            });
        }
        // SAFETY: `raw` is a fresh, valid descriptor owned by no one else.
        let memfd = unsafe { <OwnedFd as std::os::fd::FromRawFd>::from_raw_fd(raw) };

        let mut file = File::from(memfd);
        file.write_all(&self.as_bytes())
            .map_err(|e| SeccompError::Export {
                context: "failed to write program into memfd".to_string(),
                source: e,
            })?;
        file.seek(SeekFrom::Start(0))
            .map_err(|e| SeccompError::Export {
                context: "failed to rewind memfd".to_string(),
                source: e,
            })?;

        let fd = OwnedFd::from(file);
        // SAFETY: plain fcntl on a descriptor we own.
        let sealed = unsafe {
            libc::fcntl(
                std::os::fd::AsRawFd::as_raw_fd(&fd),
                libc::F_ADD_SEALS,
                libc::F_SEAL_SHRINK | libc::F_SEAL_GROW | libc::F_SEAL_WRITE,
            )
        };
        if sealed == -1 {
            return Err(SeccompError::Export {
                context: "failed to seal memfd".to_string(),
                source: std::io::Error::last_os_error(),
            });
        }

        Ok(fd)
    }
}

/// Synthesizes the filter for a resolved configuration.
///
/// # Errors
///
/// Returns `SeccompError::UnsupportedArchitecture` off x86_64/aarch64 and
/// `SeccompError::Backend` if the rule set fails to compile.
#[instrument(skip_all, fields(services = cfg.services().len()))]
pub fn synthesize(cfg: &ResolvedConfig) -> Result<SeccompProgram, SeccompError> {
    let mut rules = Vec::new();

    for &(name, number) in BASELINE_SYSCALLS {
        rules.push(SyscallRule {
            name,
            number,
            origin: "baseline",
            condition: RuleCondition::Always,
        });
    }
    for &(name, number) in ARCH_SYSCALLS {
        rules.push(SyscallRule {
            name,
            number,
            origin: "baseline",
            condition: RuleCondition::Always,
        });
    }

    // Process creation is allowed, namespace creation is not: clone may
    // run only with every CLONE_NEW* bit clear. unshare/setns/clone3 are
    // absent from the allow-list entirely.
    rules.push(SyscallRule {
        name: "clone",
        number: libc::SYS_clone,
        origin: "baseline",
        condition: RuleCondition::ArgMaskedEq {
            index: 0,
            mask: CLONE_NEW_MASK,
            value: 0,
        },
    });

    let network = cfg.network_shared();
    if network {
        rules.push(SyscallRule {
            name: "socket",
            number: libc::SYS_socket,
            origin: "network",
            condition: RuleCondition::Always,
        });
        for &(name, number) in NETWORK_SYSCALLS {
            rules.push(SyscallRule {
                name,
                number,
                origin: "network",
                condition: RuleCondition::Always,
            });
        }
    } else {
        // Local sockets only: X11, Wayland, D-Bus and the helper channel
        // all speak AF_UNIX.
        rules.push(SyscallRule {
            name: "socket",
            number: libc::SYS_socket,
            origin: "baseline",
            condition: RuleCondition::ArgEq {
                index: 0,
                value: libc::AF_UNIX as u64,
            },
        });
    }
    rules.push(SyscallRule {
        name: "socketpair",
        number: libc::SYS_socketpair,
        origin: "baseline",
        condition: RuleCondition::ArgEq {
            index: 0,
            value: libc::AF_UNIX as u64,
        },
    });

    // Per-service contributions. Exhaustive: a new service kind does not
    // compile until its syscall needs are stated, even if the statement
    // is "nothing beyond the baseline".
    for service in cfg.services() {
        match service {
            // Socket family handled above from the resolved demand set.
            Service::Network(_) => {}
            // File and socket I/O only; covered by the baseline.
            Service::Filesystem(_)
            | Service::PulseAudio(_)
            | Service::X11(_)
            | Service::Wayland(_)
            | Service::DBus(_)
            | Service::Notification
            | Service::Systray => {}
            // DRM ioctls ride on the baseline ioctl rule; sched_setattr
            // is used by Mesa's submission threads.
            Service::Gpu(_) => {
                push_unique(
                    &mut rules,
                    SyscallRule {
                        name: "sched_setattr",
                        number: libc::SYS_sched_setattr,
                        origin: "gpu",
                        condition: RuleCondition::Always,
                    },
                );
                push_unique(
                    &mut rules,
                    SyscallRule {
                        name: "sched_getattr",
                        number: libc::SYS_sched_getattr,
                        origin: "gpu",
                        condition: RuleCondition::Always,
                    },
                );
            }
        }
    }

    let program = compile(&rules)?;
    debug!(
        rules = rules.len(),
        instructions = program.len(),
        network,
        "Seccomp program synthesized"
    );
    Ok(SeccompProgram { rules, program })
}

fn push_unique(rules: &mut Vec<SyscallRule>, rule: SyscallRule) {
    if !rules.iter().any(|existing| existing.name == rule.name) {
        rules.push(rule);
    }
}

fn target_arch() -> Result<TargetArch, SeccompError> {
    if cfg!(target_arch = "x86_64") {
        Ok(TargetArch::x86_64)
    } else if cfg!(target_arch = "aarch64") {
        Ok(TargetArch::aarch64)
    } else {
        Err(SeccompError::UnsupportedArchitecture)
    }
}

fn compile(rules: &[SyscallRule]) -> Result<BpfProgram, SeccompError> {
    let mut rule_map: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();

    for rule in rules {
        let compiled = match &rule.condition {
            // An empty rule list allows the syscall unconditionally; it
            // must not coexist with conditioned rules for the same
            // number, which the map entry check below guarantees.
            RuleCondition::Always => None,
            RuleCondition::ArgMaskedEq { index, mask, value } => Some(
                SeccompRule::new(vec![SeccompCondition::new(
                    *index,
                    SeccompCmpArgLen::Qword,
                    SeccompCmpOp::MaskedEq(*mask),
                    *value,
                )
                .map_err(backend_error)?])
                .map_err(backend_error)?,
            ),
            RuleCondition::ArgEq { index, value } => Some(
                SeccompRule::new(vec![SeccompCondition::new(
                    *index,
                    SeccompCmpArgLen::Qword,
                    SeccompCmpOp::Eq,
                    *value,
                )
                .map_err(backend_error)?])
                .map_err(backend_error)?,
            ),
        };

        let entry = rule_map.entry(rule.number).or_default();
        match compiled {
            Some(compiled) => entry.push(compiled),
            None => entry.clear(),
        }
        trace!(syscall = rule.name, origin = rule.origin, "Rule emitted");
    }

    let filter = SeccompFilter::new(
        rule_map,
        // Deny by default: unmatched syscalls fail with EPERM instead of
        // being silently allowed.
        SeccompAction::Errno(libc::EPERM as u32),
        SeccompAction::Allow,
        target_arch()?,
    )
    .map_err(backend_error)?;

    filter.try_into().map_err(backend_error)
}

fn backend_error(err: impl std::fmt::Display) -> SeccompError {
    SeccompError::Backend {
        reason: err.to_string(),
    }
}
