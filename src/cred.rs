//! Caller credential adoption.
//!
//! Operations that create host filesystem entries must run with the
//! requesting client's effective uid/gid so that ownership and permission
//! checks land on the caller, not on the server. The switch uses direct
//! `setresuid`/`setresgid` syscalls: unlike the libc wrappers, a raw
//! syscall changes only the calling thread, which is what keeps concurrent
//! request handlers from observing each other's credentials.
//!
//! Failing to restore the server's own credentials afterwards would leave
//! the whole process serving with someone else's identity, so restore
//! failure aborts.

use std::io;

use log::error;

fn setresgid_thread(gid: libc::gid_t) -> io::Result<()> {
    let rc = unsafe {
        libc::syscall(
            libc::SYS_setresgid,
            -1 as libc::c_long,
            gid as libc::c_long,
            -1 as libc::c_long,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn setresuid_thread(uid: libc::uid_t) -> io::Result<()> {
    let rc = unsafe {
        libc::syscall(
            libc::SYS_setresuid,
            -1 as libc::c_long,
            uid as libc::c_long,
            -1 as libc::c_long,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// RAII guard holding the calling thread's effective ids switched to the
/// request's caller. Dropping it restores the previous ids.
pub struct CredGuard {
    uid: libc::uid_t,
    gid: libc::gid_t,
}

impl CredGuard {
    /// Switches the effective gid, then the effective uid. If the uid
    /// switch fails the gid is rolled back before the error is returned, so
    /// a failed switch never leaves mixed credentials behind.
    pub fn switch(uid: u32, gid: u32) -> io::Result<CredGuard> {
        let old_uid = unsafe { libc::geteuid() };
        let old_gid = unsafe { libc::getegid() };
        setresgid_thread(gid)?;
        if let Err(err) = setresuid_thread(uid) {
            if setresgid_thread(old_gid).is_err() {
                error!("failed to roll back egid {gid} -> {old_gid}, aborting");
                std::process::abort();
            }
            return Err(err);
        }
        Ok(CredGuard {
            uid: old_uid,
            gid: old_gid,
        })
    }
}

impl Drop for CredGuard {
    fn drop(&mut self) {
        if setresuid_thread(self.uid).is_err() || setresgid_thread(self.gid).is_err() {
            error!("failed to restore euid/egid {}:{}, aborting", self.uid, self.gid);
            std::process::abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switching_to_own_ids_round_trips() {
        let uid = unsafe { libc::geteuid() };
        let gid = unsafe { libc::getegid() };
        {
            let _guard = CredGuard::switch(uid, gid).unwrap();
            assert_eq!(unsafe { libc::geteuid() }, uid);
            assert_eq!(unsafe { libc::getegid() }, gid);
        }
        assert_eq!(unsafe { libc::geteuid() }, uid);
        assert_eq!(unsafe { libc::getegid() }, gid);
    }

    #[test]
    fn switching_to_foreign_ids_fails_cleanly_when_unprivileged() {
        if unsafe { libc::geteuid() } == 0 {
            // Root can switch to anything; the failure path needs an
            // unprivileged process.
            return;
        }
        let gid = unsafe { libc::getegid() };
        assert!(CredGuard::switch(0, gid).is_err());
        // A failed switch must leave both ids untouched.
        assert_eq!(unsafe { libc::getegid() }, gid);
    }
}
