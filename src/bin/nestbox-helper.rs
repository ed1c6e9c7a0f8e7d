//! nestbox-helper — the process that runs inside every sandbox.
//!
//! Launched by the containment primitive as the sandbox's first process.
//! It inherits the helper channel on a fixed descriptor number (passed
//! as `--channel-fd`, since the sandbox has no view of host-side
//! naming), performs the startup handshake, launches the application,
//! and then serves host requests until shutdown.

use std::os::fd::{FromRawFd, OwnedFd};

use clap::Parser;
use miette::{miette, Result};

use nestbox::helper::{serve, Channel};

/// In-sandbox helper for nestbox; not meant to be run by hand.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Descriptor number of the inherited helper channel.
    #[arg(long)]
    channel_fd: i32,

    /// Application command line to start once the channel is up.
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.channel_fd <= 2 {
        return Err(miette!(
            "--channel-fd {} is not an inheritable descriptor",
            args.channel_fd
        ));
    }
    // SAFETY: the descriptor was installed for us by the launcher; we
    // are its only owner inside the sandbox.
    let fd = unsafe { OwnedFd::from_raw_fd(args.channel_fd) };
    let chan = Channel::from_fd(fd);

    serve::run(&chan, &args.command).map_err(nestbox::Error::from)?;
    Ok(())
}
