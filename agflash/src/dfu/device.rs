//! Device identity, version discovery and session handshakes.

use {
    crate::{
        error::{Error, Result},
        image::binary::{FINAL_BOOTLOADER_VERSION, LEGACY_VERSION},
        port::Port,
        protocol::{command::Command, link::CommandLink},
    },
    byteorder::{ByteOrder, LittleEndian},
    log::{debug, info, warn},
    serde_json::Value,
    std::{
        fmt,
        str::FromStr,
        time::{Duration, Instant},
    },
};

/// Line the TG application prints while offering an update window.
pub const HANDSHAKE_PROMPT: &str = "UpdateAvailable?";

/// Raw answer that makes the TG application open its CLI.
pub const HANDSHAKE_REPLY: &str = "Yes|EnterCLI";

/// Banner printed when a CLI session opens.
pub const CLI_BANNER: &str = "Welcome";

/// Banner printed once the TG application has booted.
pub const TG_APP_BANNER: &str = "TG APP CLI console Task";

/// EEPROM update-info banks, each 16 bytes.
const VERSION_BANKS: [u32; 2] = [0x180, 0x2180];
const BANK_LEN: usize = 16;
const BANK_MAGIC: u32 = 0xDEFE_C8ED;
const MAGIC_WORD: usize = 2;
const COUNTER_WORD: usize = 3;

/// Application personality the device is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceMode {
    /// Factory (manufacturing) application.
    Factory,
    /// Shipping TG application.
    TgApp,
}

impl DeviceMode {
    /// Console banner printed once this personality is up.
    pub fn banner(self) -> &'static str {
        match self {
            Self::Factory => CLI_BANNER,
            Self::TgApp => TG_APP_BANNER,
        }
    }

    /// Key of the application version in the `SYS FW_VER` reply.
    pub fn version_key(self) -> &'static str {
        match self {
            Self::Factory => "CLI",
            Self::TgApp => "TG_APP",
        }
    }
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Factory => write!(f, "FACT"),
            Self::TgApp => write!(f, "TG_APP"),
        }
    }
}

impl FromStr for DeviceMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s
            .to_ascii_uppercase()
            .as_str()
        {
            "FACT" => Ok(Self::Factory),
            "TG_APP" => Ok(Self::TgApp),
            other => Err(format!("unknown device mode '{other}', expected FACT or TG_APP")),
        }
    }
}

/// Versions reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceVersionState {
    /// Running bootloader version.
    pub bootloader: u32,
    /// Running application version.
    pub application: u32,
    /// Running personality.
    pub mode: DeviceMode,
}

impl fmt::Display for DeviceVersionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} - v{}] [BTL - v{}]",
            self.mode, self.application, self.bootloader
        )
    }
}

/// Timeouts of a whole update session.
#[derive(Debug, Clone)]
pub struct SessionTimeouts {
    /// `SYS FW_VER` and the EEPROM reads behind it.
    pub version_query: Duration,
    /// Wait for the TG application's handshake prompt.
    pub handshake: Duration,
    /// Wait for the CLI banner after answering the prompt.
    pub enter_cli: Duration,
    /// Boot of the TG application.
    pub tg_app_boot: Duration,
    /// Boot of the factory application.
    pub factory_boot: Duration,
    /// Pause after an application commit reboot before listening again.
    pub settle: Duration,
    /// `EXMEM FORMAT`.
    pub exmem_format: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            version_query: Duration::from_secs(2),
            handshake: Duration::from_secs(6 * 60),
            enter_cli: Duration::from_secs(5),
            tg_app_boot: Duration::from_secs(3 * 60),
            factory_boot: Duration::from_secs(50),
            settle: Duration::from_secs(20),
            exmem_format: Duration::from_secs(5 * 60),
        }
    }
}

impl SessionTimeouts {
    /// Boot timeout of `mode`.
    pub fn boot(&self, mode: DeviceMode) -> Duration {
        match mode {
            DeviceMode::Factory => self.factory_boot,
            DeviceMode::TgApp => self.tg_app_boot,
        }
    }
}

/// Ask the device for its bootloader and application versions.
pub fn query_versions<P: Port>(
    link: &mut CommandLink<P>,
    mode: DeviceMode,
    timeouts: &SessionTimeouts,
) -> Result<DeviceVersionState> {
    let command = Command::firmware_versions();
    let reply = link.execute(&command, timeouts.version_query)?;

    let Some(bootloader) = version_field(&reply.msg, "BTL") else {
        info!("Device does not report a bootloader version; assuming v{LEGACY_VERSION}");
        return Ok(DeviceVersionState {
            bootloader: LEGACY_VERSION,
            application: LEGACY_VERSION,
            mode,
        });
    };
    let bootloader = if bootloader > FINAL_BOOTLOADER_VERSION {
        debug!("Bootloader reports v{bootloader}, treating as v{LEGACY_VERSION}");
        LEGACY_VERSION
    } else {
        bootloader
    };

    let application = match version_field(&reply.msg, mode.version_key()) {
        Some(version) => version,
        None if mode == DeviceMode::TgApp => tg_app_version_from_eeprom(link, timeouts)?,
        None => {
            return Err(Error::MalformedResponse {
                command: command.to_string(),
                raw: reply
                    .msg
                    .to_string(),
            });
        },
    };

    Ok(DeviceVersionState {
        bootloader,
        application,
        mode,
    })
}

fn version_field(msg: &Value, key: &str) -> Option<u32> {
    match msg.get(key)? {
        Value::Number(n) => n
            .as_u64()
            .and_then(|v| u32::try_from(v).ok()),
        Value::String(s) => s
            .trim()
            .parse()
            .ok(),
        _ => None,
    }
}

/// Recover the TG application version from the EEPROM update-info banks.
fn tg_app_version_from_eeprom<P: Port>(
    link: &mut CommandLink<P>,
    timeouts: &SessionTimeouts,
) -> Result<u32> {
    warn!("TG application does not report its version; reading EEPROM update info");
    let mut banks = [[0u32; 4]; 2];
    for (bank, address) in banks
        .iter_mut()
        .zip(VERSION_BANKS)
    {
        *bank = read_version_bank(link, address, timeouts.version_query)?;
    }
    let version = select_tg_app_version(banks[0], banks[1]);
    debug!("EEPROM banks {banks:x?} -> v{version}");
    Ok(version)
}

fn read_version_bank<P: Port>(
    link: &mut CommandLink<P>,
    address: u32,
    timeout: Duration,
) -> Result<[u32; 4]> {
    let command = Command::eeprom_read(address, BANK_LEN);
    let reply = link.execute(&command, timeout)?;
    let malformed = || Error::MalformedResponse {
        command: command.to_string(),
        raw: reply
            .msg
            .to_string(),
    };

    let text = reply
        .msg
        .get(format!("{address:#010x}"))
        .and_then(Value::as_str)
        .ok_or_else(malformed)?;
    let bytes = text
        .split_whitespace()
        .map(|b| u8::from_str_radix(b, 16))
        .collect::<std::result::Result<Vec<u8>, _>>()
        .map_err(|_| malformed())?;
    if bytes.len() != BANK_LEN {
        return Err(malformed());
    }

    // Words are read from the end of the bank.
    Ok([
        LittleEndian::read_u32(&bytes[12..16]),
        LittleEndian::read_u32(&bytes[8..12]),
        LittleEndian::read_u32(&bytes[4..8]),
        LittleEndian::read_u32(&bytes[0..4]),
    ])
}

/// Pick the TG application version out of two update-info banks.
///
/// A bank stamped with the magic word wins outright. Otherwise the bank with
/// the newer write counter wins, where a counter that wrapped from
/// `u32::MAX` to zero counts as newer.
pub fn select_tg_app_version(first: [u32; 4], second: [u32; 4]) -> u32 {
    let first_stamped = first[MAGIC_WORD] == BANK_MAGIC;
    let second_stamped = second[MAGIC_WORD] == BANK_MAGIC;
    match (first_stamped, second_stamped) {
        (true, false) => return first[0],
        (false, true) => return second[0],
        _ => {},
    }
    // Unstamped banks keep the version in the magic slot.
    let slot = if first_stamped { 0 } else { MAGIC_WORD };

    let (a, b) = (first[COUNTER_WORD], second[COUNTER_WORD]);
    let newer = if a == u32::MAX && b == 0 {
        second
    } else if b == u32::MAX && a == 0 {
        first
    } else if a > b {
        first
    } else {
        second
    };
    newer[slot]
}

/// Answer the TG application's update prompt and wait for its CLI.
pub fn handshake<P: Port>(link: &mut CommandLink<P>, timeouts: &SessionTimeouts) -> Result<()> {
    info!("Waiting for handshake...");
    let deadline = Instant::now() + timeouts.handshake;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::Handshake(format!(
                "no {HANDSHAKE_PROMPT} prompt within {}s",
                timeouts
                    .handshake
                    .as_secs()
            )));
        }
        if link
            .wait_for(&[HANDSHAKE_PROMPT], remaining)?
            .is_none()
        {
            continue;
        }

        link.write_raw(HANDSHAKE_REPLY.as_bytes())?;
        if link
            .wait_for(&[CLI_BANNER], timeouts.enter_cli)?
            .is_some()
        {
            info!("Handshake successful");
            return Ok(());
        }
        warn!("No CLI banner after handshake reply; waiting for the next prompt");
    }
}

/// Wait for `mode`'s boot banner.
pub fn wait_for_boot<P: Port>(
    link: &mut CommandLink<P>,
    mode: DeviceMode,
    timeouts: &SessionTimeouts,
) -> Result<()> {
    let timeout = timeouts.boot(mode);
    info!("Waiting for {mode} to boot...");
    match link.wait_for(&[mode.banner()], timeout)? {
        Some(_) => Ok(()),
        None => Err(Error::Timeout(format!(
            "{mode} did not boot within {}s",
            timeout.as_secs()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::port::sim::{SimDevice, module_of, pass},
    };

    fn quick() -> SessionTimeouts {
        SessionTimeouts {
            handshake: Duration::from_millis(100),
            enter_cli: Duration::from_millis(20),
            tg_app_boot: Duration::from_millis(20),
            factory_boot: Duration::from_millis(20),
            settle: Duration::ZERO,
            ..SessionTimeouts::default()
        }
    }

    fn versions_sim(msg: &'static str) -> SimDevice {
        SimDevice::new(move |cmd, _| Some(pass(module_of(cmd), msg)))
    }

    fn bank_text(words_from_end: [u32; 4]) -> String {
        let mut bytes = [0u8; 16];
        LittleEndian::write_u32(&mut bytes[12..16], words_from_end[0]);
        LittleEndian::write_u32(&mut bytes[8..12], words_from_end[1]);
        LittleEndian::write_u32(&mut bytes[4..8], words_from_end[2]);
        LittleEndian::write_u32(&mut bytes[0..4], words_from_end[3]);
        bytes
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn test_mode_parse_and_display() {
        assert_eq!("FACT".parse::<DeviceMode>().unwrap(), DeviceMode::Factory);
        assert_eq!("tg_app".parse::<DeviceMode>().unwrap(), DeviceMode::TgApp);
        assert!("APP".parse::<DeviceMode>().is_err());
        assert_eq!(DeviceMode::TgApp.to_string(), "TG_APP");
        assert_eq!(DeviceMode::TgApp.banner(), "TG APP CLI console Task");
        assert_eq!(DeviceMode::Factory.banner(), "Welcome");
    }

    #[test]
    fn test_query_versions_factory() {
        let mut link = CommandLink::new(versions_sim(r#"{"BTL": 4011, "CLI": "4012"}"#));
        let state = query_versions(&mut link, DeviceMode::Factory, &quick()).unwrap();
        assert_eq!(state.bootloader, 4011);
        assert_eq!(state.application, 4012);
        assert_eq!(state.mode, DeviceMode::Factory);
        assert_eq!(link.port().commands, vec!["SYS FW_VER"]);
    }

    #[test]
    fn test_query_versions_legacy_device() {
        let mut link = CommandLink::new(versions_sim(r#"{"CLI": 4007}"#));
        let state = query_versions(&mut link, DeviceMode::Factory, &quick()).unwrap();
        assert_eq!((state.bootloader, state.application), (4005, 4005));
    }

    #[test]
    fn test_query_versions_placeholder_bootloader() {
        let mut link = CommandLink::new(versions_sim(r#"{"BTL": 65535, "TG_APP": 4009}"#));
        let state = query_versions(&mut link, DeviceMode::TgApp, &quick()).unwrap();
        assert_eq!((state.bootloader, state.application), (4005, 4009));
    }

    #[test]
    fn test_query_versions_missing_factory_version() {
        let mut link = CommandLink::new(versions_sim(r#"{"BTL": 4011}"#));
        let err = query_versions(&mut link, DeviceMode::Factory, &quick()).unwrap_err();
        assert!(matches!(err, Error::MalformedResponse { .. }));
    }

    #[test]
    fn test_query_versions_eeprom_fallback() {
        let old = bank_text([4010, 0, BANK_MAGIC, 7]);
        let new = bank_text([4012, 0, BANK_MAGIC, 8]);
        let sim = SimDevice::new(move |cmd, _| {
            let msg = match cmd {
                "SYS FW_VER" => r#"{"BTL": 4011}"#.to_string(),
                "EEPROM READ 180 16" => format!(r#"{{"0x00000180": "{old}"}}"#),
                "EEPROM READ 2180 16" => format!(r#"{{"0x00002180": "{new}"}}"#),
                _ => "{}".to_string(),
            };
            Some(pass(module_of(cmd), &msg))
        });
        let mut link = CommandLink::new(sim);
        let state = query_versions(&mut link, DeviceMode::TgApp, &quick()).unwrap();
        assert_eq!(state.application, 4012);
        assert_eq!(
            link.port().commands,
            vec!["SYS FW_VER", "EEPROM READ 180 16", "EEPROM READ 2180 16"]
        );
    }

    #[test]
    fn test_eeprom_fallback_rejects_short_bank() {
        let sim = SimDevice::new(|cmd, _| {
            let msg = if cmd == "SYS FW_VER" {
                r#"{"BTL": 4011}"#
            } else {
                r#"{"0x00000180": "00 11"}"#
            };
            Some(pass(module_of(cmd), msg))
        });
        let mut link = CommandLink::new(sim);
        let err = query_versions(&mut link, DeviceMode::TgApp, &quick()).unwrap_err();
        assert!(matches!(err, Error::MalformedResponse { .. }));
    }

    #[test]
    fn test_select_single_stamped_bank() {
        assert_eq!(
            select_tg_app_version([4011, 0, BANK_MAGIC, 1], [4012, 0, 4013, 9]),
            4011
        );
        assert_eq!(
            select_tg_app_version([4011, 0, 4013, 9], [4012, 0, BANK_MAGIC, 1]),
            4012
        );
    }

    #[test]
    fn test_select_by_counter() {
        assert_eq!(
            select_tg_app_version([4011, 0, BANK_MAGIC, 3], [4012, 0, BANK_MAGIC, 4]),
            4012
        );
        assert_eq!(
            select_tg_app_version([4011, 0, BANK_MAGIC, 5], [4012, 0, BANK_MAGIC, 4]),
            4011
        );
    }

    #[test]
    fn test_select_counter_wraparound() {
        assert_eq!(
            select_tg_app_version([4011, 0, BANK_MAGIC, u32::MAX], [4012, 0, BANK_MAGIC, 0]),
            4012
        );
        assert_eq!(
            select_tg_app_version([4011, 0, BANK_MAGIC, 0], [4012, 0, BANK_MAGIC, u32::MAX]),
            4011
        );
    }

    #[test]
    fn test_select_unstamped_uses_magic_slot() {
        assert_eq!(select_tg_app_version([1, 0, 4008, 2], [2, 0, 4009, 1]), 4008);
    }

    #[test]
    fn test_handshake_success() {
        let mut sim = SimDevice::new(|cmd, _| {
            (cmd == HANDSHAKE_REPLY).then(|| "\r\nWelcome to TG CLI\r\n".to_string())
        });
        sim.emit("boot log\r\nUpdateAvailable?\r\n");
        let mut link = CommandLink::new(sim);
        handshake(&mut link, &quick()).unwrap();
        assert_eq!(link.port().commands, vec![HANDSHAKE_REPLY]);
    }

    #[test]
    fn test_handshake_without_prompt_fails() {
        let mut link = CommandLink::new(SimDevice::new(|_, _| None));
        let err = handshake(&mut link, &quick()).unwrap_err();
        assert!(matches!(err, Error::Handshake(_)));
    }

    #[test]
    fn test_handshake_without_banner_fails() {
        let mut sim = SimDevice::new(|_, _| None);
        sim.emit("UpdateAvailable?\r\n");
        let mut link = CommandLink::new(sim);
        let err = handshake(&mut link, &quick()).unwrap_err();
        assert!(matches!(err, Error::Handshake(_)));
        assert_eq!(link.port().commands, vec![HANDSHAKE_REPLY]);
    }

    #[test]
    fn test_wait_for_boot() {
        let mut sim = SimDevice::passing();
        sim.emit("TG APP CLI console Task running\r\n");
        let mut link = CommandLink::new(sim);
        assert!(wait_for_boot(&mut link, DeviceMode::TgApp, &quick()).is_ok());
        assert!(matches!(
            wait_for_boot(&mut link, DeviceMode::Factory, &quick()),
            Err(Error::Timeout(_))
        ));
    }
}
