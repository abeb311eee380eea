//! Process persona: identity capture, uid/gid switching, login environment.

use std::ffi::CString;
use std::fmt;
use std::io;

use nix::unistd::{self, Gid, Group, Uid, User};
use tracing::{debug, info};

use crate::error::PersonaError;

/// A uid/gid pair plus supplementary groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uid: Uid,
    pub gid: Gid,
    pub groups: Vec<Gid>,
}

impl Identity {
    /// Captures the current effective identity.
    pub fn effective() -> Self {
        Self {
            uid: unistd::geteuid(),
            gid: unistd::getegid(),
            groups: unistd::getgroups().unwrap_or_default(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.uid, self.gid)
    }
}

/// Identity at startup and the identity the service runs under.
#[derive(Debug, Clone)]
pub struct Persona {
    /// Persona at the moment the service was started.
    pub start: Identity,
    /// Persona the service is running at.
    pub running: Identity,
}

/// Which setuid/setgid family to use for the switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersonaSwitchMode {
    /// `setuid`/`setgid`: one-way switch, cannot go back.
    #[default]
    SetRealId,
    /// `seteuid`/`setegid`: can go back to the previous user.
    SetEffectiveId,
    /// `setresuid`/`setresgid` keeping the real ids: can go back, and the
    /// saved set-user-ID allows the new persona to signal us.
    SetEffectiveAndSavedId,
}

/// Persona switch targets, populated from `service.user` / `service.group` /
/// `service.loginEnv`.
#[derive(Debug, Clone, Default)]
pub struct PersonaConfig {
    pub username: Option<String>,
    pub groupname: Option<String>,
    pub login_env: bool,
}

impl PersonaConfig {
    pub fn is_empty(&self) -> bool {
        self.username.is_none() && self.groupname.is_none()
    }
}

fn errno_io(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

fn switch_gid(gid: Gid, mode: PersonaSwitchMode) -> Result<(), PersonaError> {
    info!("Switching to gid <{gid}>.");
    let result = match mode {
        PersonaSwitchMode::SetRealId => unistd::setgid(gid).map_err(errno_io),
        PersonaSwitchMode::SetEffectiveId => unistd::setegid(gid).map_err(errno_io),
        PersonaSwitchMode::SetEffectiveAndSavedId => {
            // keep the real gid (-1), set effective and saved
            let keep = !0 as libc::gid_t;
            if unsafe { libc::setresgid(keep, gid.as_raw(), gid.as_raw()) } == 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        }
    };
    result.map_err(|source| PersonaError::Switch {
        what: format!("switch to gid <{gid}>"),
        source,
    })
}

fn switch_uid(username: &str, uid: Uid, gid: Gid, mode: PersonaSwitchMode) -> Result<(), PersonaError> {
    info!("Setting supplementary groups for user <{username}>.");
    let cname = CString::new(username).map_err(|_| PersonaError::NoSuchUser(username.into()))?;
    unistd::initgroups(&cname, gid).map_err(|e| PersonaError::Switch {
        what: format!("initialize supplementary groups for user <{username}>"),
        source: errno_io(e),
    })?;

    info!("Switching to uid <{uid}>.");
    let result = match mode {
        PersonaSwitchMode::SetRealId => unistd::setuid(uid).map_err(errno_io),
        PersonaSwitchMode::SetEffectiveId => unistd::seteuid(uid).map_err(errno_io),
        PersonaSwitchMode::SetEffectiveAndSavedId => {
            let keep = !0 as libc::uid_t;
            if unsafe { libc::setresuid(keep, uid.as_raw(), uid.as_raw()) } == 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        }
    };
    result.map_err(|source| PersonaError::Switch {
        what: format!("switch to uid <{uid}>"),
        source,
    })
}

/// Switches the process persona per `config`.
///
/// `chown_log` runs with the target ids before the switch so the log file
/// stays writable afterwards. Returns the start/running identity pair.
pub(crate) fn switch_persona(
    config: &PersonaConfig,
    mode: PersonaSwitchMode,
    chown_log: impl FnOnce(Uid, Gid),
) -> Result<Persona, PersonaError> {
    let start = Identity::effective();
    let mut persona = Persona {
        running: start.clone(),
        start,
    };

    if config.is_empty() {
        return Ok(persona);
    }

    let username = config.username.as_deref().unwrap_or("");
    let groupname = config.groupname.as_deref().unwrap_or("");
    info!("Trying to run under {username}:{groupname}.");

    let mut target_user = None;
    if let Some(name) = &config.username {
        let user = User::from_name(name)
            .map_err(|e| PersonaError::Switch {
                what: format!("look up user <{name}>"),
                source: errno_io(e),
            })?
            .ok_or_else(|| PersonaError::NoSuchUser(name.clone()))?;
        persona.running.uid = user.uid;
        persona.running.gid = user.gid;
        target_user = Some(user);
    }

    if let Some(name) = &config.groupname {
        let group = Group::from_name(name)
            .map_err(|e| PersonaError::Switch {
                what: format!("look up group <{name}>"),
                source: errno_io(e),
            })?
            .ok_or_else(|| PersonaError::NoSuchGroup(name.clone()))?;
        persona.running.gid = group.gid;
    }

    // the log file must survive the privilege drop
    chown_log(persona.running.uid, persona.running.gid);

    if config.groupname.is_some() || target_user.is_some() {
        switch_gid(persona.running.gid, mode)?;
    }

    if let Some(user) = &target_user {
        switch_uid(&user.name, persona.running.uid, persona.running.gid, mode)?;
    }

    info!("Run under {username}:{groupname}.");
    Ok(persona)
}

/// Applies login-like environment (`USER`, `LOGNAME`, `HOME`, `SHELL`)
/// derived from the running uid's passwd entry.
///
/// Not thread safe; the driver calls it while the process is still
/// single-threaded.
pub(crate) fn apply_login_env(persona: &Persona) -> Result<(), PersonaError> {
    let user = User::from_uid(persona.running.uid)
        .map_err(|e| PersonaError::Switch {
            what: format!("look up passwd entry for uid {}", persona.running.uid),
            source: errno_io(e),
        })?
        .ok_or_else(|| PersonaError::NoSuchUser(persona.running.uid.to_string()))?;

    unsafe {
        std::env::set_var("USER", &user.name);
        std::env::set_var("LOGNAME", &user.name);
        std::env::set_var("HOME", &user.dir);
        std::env::set_var("SHELL", &user.shell);
    }
    Ok(())
}

/// Runs `call` under the start identity, switching back afterwards.
///
/// Only meaningful when the persona was switched with one of the effective
/// modes; with no persona the call runs as is.
pub fn run_elevated<T>(
    persona: Option<&Persona>,
    call: impl FnOnce() -> T,
) -> Result<T, PersonaError> {
    let Some(persona) = persona else {
        return Ok(call());
    };

    debug!("Switching to persona: <{}>.", persona.start);
    unistd::seteuid(persona.start.uid).map_err(|e| PersonaError::Switch {
        what: format!("regain uid <{}>", persona.start.uid),
        source: errno_io(e),
    })?;
    unistd::setegid(persona.start.gid).map_err(|e| PersonaError::Switch {
        what: format!("regain gid <{}>", persona.start.gid),
        source: errno_io(e),
    })?;

    let result = call();

    debug!("Switching back to persona: <{}>.", persona.running);
    unistd::setegid(persona.running.gid).map_err(|e| PersonaError::Switch {
        what: format!("drop to gid <{}>", persona.running.gid),
        source: errno_io(e),
    })?;
    unistd::seteuid(persona.running.uid).map_err(|e| PersonaError::Switch {
        what: format!("drop to uid <{}>", persona.running.uid),
        source: errno_io(e),
    })?;

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_identity_matches_process() {
        let identity = Identity::effective();
        assert_eq!(identity.uid, unistd::geteuid());
        assert_eq!(identity.gid, unistd::getegid());
    }

    #[test]
    fn empty_config_keeps_identity() {
        let config = PersonaConfig::default();
        let persona =
            switch_persona(&config, PersonaSwitchMode::SetRealId, |_, _| {}).expect("no switch");
        assert_eq!(persona.start, persona.running);
    }

    #[test]
    fn unknown_user_is_rejected() {
        let config = PersonaConfig {
            username: Some("no-such-user-svckit".into()),
            ..PersonaConfig::default()
        };
        let err = switch_persona(&config, PersonaSwitchMode::SetRealId, |_, _| {})
            .expect_err("unknown user must fail");
        assert!(matches!(err, PersonaError::NoSuchUser(_)));
    }

    #[test]
    fn run_elevated_without_persona_just_calls() {
        let value = run_elevated(None, || 7).expect("plain call");
        assert_eq!(value, 7);
    }
}
