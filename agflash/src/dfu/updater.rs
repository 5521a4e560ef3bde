//! Update orchestrator.
//!
//! Owns the command link for a whole session: connects (handshaking with the
//! TG application when needed), reads the device versions, asks the gate for
//! a plan and runs it step by step. Between steps that reboot the device it
//! waits for the new personality to come back before continuing.

use {
    crate::{
        dfu::{
            DeviceMode, DeviceVersionState, SessionTimeouts,
            ble::{self, BleLayout, SensorLayout},
            device,
            engine::{TransferEngine, TransferProfile},
            gate::{Finalize, SmtPlan, TransferPlan, UpdateRequest, plan_smt_simulation, plan_update},
        },
        error::{Error, Result},
        image::{
            BinaryImage,
            package::{BlePackage, SensorPackage},
        },
        port::Port,
        protocol::{
            command::{Command, module, verb},
            link::CommandLink,
        },
    },
    log::{debug, info, warn},
    std::{thread, time::Instant},
};

/// Shown before every bootloader commit.
pub const BOOTLOADER_WARNING: &str = "The device may not boot, or may not accept further updates, \
     if the bootloader update is interrupted. Keep the device powered and do not stop the tool.";

/// BLE radio versions read around one or more radio updates.
///
/// `None` means the radio did not report a version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BleUpdateReport {
    /// Version before the first update.
    pub before: Option<String>,
    /// Version after each update, in run order.
    pub after: Vec<Option<String>>,
}

/// Firmware update session over one port.
pub struct Updater<P: Port> {
    link: CommandLink<P>,
    mode: DeviceMode,
    profile: TransferProfile,
    ble_profile: TransferProfile,
    timeouts: SessionTimeouts,
}

impl<P: Port> Updater<P> {
    /// Create a session for a device running `mode`.
    pub fn new(port: P, mode: DeviceMode) -> Self {
        Self {
            link: CommandLink::new(port),
            mode,
            profile: TransferProfile::mcu(),
            ble_profile: TransferProfile::ble(),
            timeouts: SessionTimeouts::default(),
        }
    }

    /// Override the MCU transfer profile.
    #[must_use]
    pub fn with_profile(mut self, profile: TransferProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Override the BLE/sensor transfer profile.
    #[must_use]
    pub fn with_ble_profile(mut self, profile: TransferProfile) -> Self {
        self.ble_profile = profile;
        self
    }

    /// Override the session timeouts.
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: SessionTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Personality the device is expected to be running.
    pub fn mode(&self) -> DeviceMode {
        self.mode
    }

    /// Get a reference to the command link.
    pub fn link(&self) -> &CommandLink<P> {
        &self.link
    }

    /// Open the session, handshaking with the TG application when needed.
    pub fn connect(&mut self) -> Result<()> {
        self.link
            .port_mut()
            .clear_buffers()?;
        if self.mode == DeviceMode::TgApp {
            device::handshake(&mut self.link, &self.timeouts)?;
        }
        Ok(())
    }

    /// Read the running bootloader and application versions.
    pub fn device_versions(&mut self) -> Result<DeviceVersionState> {
        let state = device::query_versions(&mut self.link, self.mode, &self.timeouts)?;
        info!("Current firmware: {state}");
        Ok(state)
    }

    /// Read the device versions and plan `request` against them.
    pub fn plan(&mut self, request: UpdateRequest) -> Result<TransferPlan> {
        let state = self.device_versions()?;
        let plan = plan_update(&state, request)?;
        debug!("Plan has {} step(s)", plan.len());
        Ok(plan)
    }

    /// Plan and run `request`.
    ///
    /// `confirm` is shown [`BOOTLOADER_WARNING`] before each bootloader
    /// commit and must return `true` to proceed. `progress` receives
    /// `(image name, bytes_sent, total)`.
    pub fn update(
        &mut self,
        request: UpdateRequest,
        confirm: &mut dyn FnMut(&str) -> bool,
        progress: &mut dyn FnMut(&str, usize, usize),
    ) -> Result<()> {
        let plan = self.plan(request)?;
        self.run_plan(&plan, confirm, progress)
    }

    /// Run a plan produced by the gate.
    pub fn run_plan(
        &mut self,
        plan: &TransferPlan,
        confirm: &mut dyn FnMut(&str) -> bool,
        progress: &mut dyn FnMut(&str, usize, usize),
    ) -> Result<()> {
        let total = plan.len();
        for (index, step) in plan
            .steps()
            .iter()
            .enumerate()
        {
            info!("Step {}/{total}: {}", index + 1, step.image);
            let name = step
                .image
                .name();
            let mut engine = TransferEngine::new(&mut self.link, &self.profile);

            let info_verb = match step.finalize {
                Finalize::Application => verb::WR_MCU_FW_INFO,
                Finalize::Bootloader { .. } => verb::WR_BTL_FW_INFO,
            };
            engine.transfer(info_verb, &step.image, &step.target, &mut |sent, len| {
                progress(name, sent, len);
            })?;

            match step.finalize {
                Finalize::Application => {
                    engine.commit_application()?;
                    engine.reboot()?;
                },
                Finalize::Bootloader { reboot } => {
                    if !confirm(BOOTLOADER_WARNING) {
                        return Err(Error::Cancelled("bootloader update not confirmed".to_string()));
                    }
                    info!("Updating bootloader...");
                    engine.commit_bootloader()?;
                    if reboot {
                        engine.reboot()?;
                    }
                },
            }

            if let Some(mode) = step.boots_into() {
                self.mode = mode;
            }
            if step.reboots() && index + 1 < total {
                self.await_reboot()?;
            }
        }
        info!("Update complete");
        Ok(())
    }

    /// Validate and run an SMT simulation with `(image, expected checksum)`
    /// pairs. The device must be running the factory application.
    pub fn smt_simulate(
        &mut self,
        images: Vec<(BinaryImage, u64)>,
        progress: &mut dyn FnMut(&str, usize, usize),
    ) -> Result<()> {
        let state = self.device_versions()?;
        let plan = plan_smt_simulation(&state, images)?;
        self.run_smt(&plan, progress)
    }

    /// Format external memory and stage both SMT images.
    pub fn run_smt(
        &mut self,
        plan: &SmtPlan,
        progress: &mut dyn FnMut(&str, usize, usize),
    ) -> Result<()> {
        info!("Preparing external memory for SMT...");
        self.link
            .execute(
                &Command::new(module::EXMEM, verb::FORMAT),
                self.timeouts
                    .exmem_format,
            )?;

        for (image, target) in plan.stages() {
            let name = image.name();
            let mut engine = TransferEngine::new(&mut self.link, &self.profile);
            engine.announce(verb::WR_MCU_FW_INFO, image, &target)?;
            engine.send_chunks(image.data(), target.write_offset, &mut |sent, len| {
                progress(name, sent, len);
            })?;
            info!("Verifying checksum of {name}");
            engine.verify_checksum()?;
        }
        info!("External flash now holds both images");
        Ok(())
    }

    /// Read the BLE radio software version.
    pub fn ble_version(&mut self) -> Result<String> {
        ble::query_ble_version(
            &mut self.link,
            self.timeouts
                .version_query,
        )
    }

    /// Stage a BLE package and start the radio DFU, reading the radio
    /// version before and after.
    pub fn update_ble(
        &mut self,
        package: &BlePackage,
        progress: &mut dyn FnMut(&str, usize, usize),
    ) -> Result<BleUpdateReport> {
        self.update_ble_alternating(package, None, 0, progress)
    }

    /// Run `repeat + 1` BLE updates, alternating between `first` and
    /// `second`. Without `second` every run installs `first`.
    ///
    /// The radio version is read once before the first run and again after
    /// every run. A version the radio does not report is logged, not fatal.
    pub fn update_ble_alternating(
        &mut self,
        first: &BlePackage,
        second: Option<&BlePackage>,
        repeat: u32,
        progress: &mut dyn FnMut(&str, usize, usize),
    ) -> Result<BleUpdateReport> {
        let mut report = BleUpdateReport {
            before: self.try_ble_version()?,
            after: Vec::new(),
        };
        info!(
            "BLE firmware before update: {}",
            report
                .before
                .as_deref()
                .unwrap_or("unknown")
        );

        for run in 0..=repeat {
            let package = match second {
                Some(second) if run % 2 == 1 => second,
                _ => first,
            };
            let started = Instant::now();
            ble::update_ble(
                &mut self.link,
                package,
                &self.ble_profile,
                &BleLayout::default(),
                progress,
            )?;

            let version = self.try_ble_version()?;
            info!(
                "BLE firmware after run {}/{}: {}",
                run + 1,
                repeat + 1,
                version
                    .as_deref()
                    .unwrap_or("unknown")
            );
            debug!(
                "Run {} took {}s",
                run + 1,
                started
                    .elapsed()
                    .as_secs()
            );
            report
                .after
                .push(version);
        }
        Ok(report)
    }

    /// Stage a sensor package, optionally starting the transfer.
    pub fn update_sensor(
        &mut self,
        package: &SensorPackage,
        start_transfer: bool,
        progress: &mut dyn FnMut(&str, usize, usize),
    ) -> Result<()> {
        ble::update_sensor(
            &mut self.link,
            package,
            &self.ble_profile,
            &SensorLayout::default(),
            start_transfer,
            progress,
        )
    }

    /// Close the port.
    pub fn close(&mut self) -> Result<()> {
        self.link
            .close()
    }

    /// Consume the session and return the port.
    pub fn into_port(self) -> P {
        self.link
            .into_port()
    }

    fn try_ble_version(&mut self) -> Result<Option<String>> {
        match self.ble_version() {
            Ok(version) => Ok(Some(version)),
            Err(
                e @ (Error::Timeout(_)
                | Error::DeviceRejected { .. }
                | Error::MalformedResponse { .. }),
            ) => {
                warn!("Could not read the BLE version: {e}");
                Ok(None)
            },
            Err(e) => Err(e),
        }
    }

    fn await_reboot(&mut self) -> Result<()> {
        if !self
            .timeouts
            .settle
            .is_zero()
        {
            info!(
                "Waiting {}s for the update to be applied...",
                self.timeouts
                    .settle
                    .as_secs()
            );
            thread::sleep(
                self.timeouts
                    .settle,
            );
        }
        device::wait_for_boot(&mut self.link, self.mode, &self.timeouts)?;
        if self.mode == DeviceMode::TgApp {
            device::handshake(&mut self.link, &self.timeouts)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            dfu::gate::{DEPENDENCY_TABLE, PlanStep, Rejection},
            image::package::tests::{ble_zip, make_zip},
            port::sim::{SimDevice, fail, module_of, pass},
        },
        std::time::Duration,
    };

    fn quick_timeouts() -> SessionTimeouts {
        SessionTimeouts {
            handshake: Duration::from_millis(100),
            enter_cli: Duration::from_millis(20),
            tg_app_boot: Duration::from_millis(20),
            factory_boot: Duration::from_millis(20),
            settle: Duration::ZERO,
            ..SessionTimeouts::default()
        }
    }

    fn quick_profile() -> TransferProfile {
        TransferProfile {
            payload_delay: Duration::ZERO,
            chunk_timeout: Duration::from_millis(20),
            ..TransferProfile::mcu()
        }
    }

    /// Device reporting `versions` for `SYS FW_VER` and passing everything else.
    fn versions_device(versions: &'static str) -> SimDevice {
        SimDevice::new(move |cmd, _| {
            let msg = if cmd == "SYS FW_VER" { versions } else { "{}" };
            Some(pass(module_of(cmd), msg))
        })
    }

    fn updater(sim: SimDevice, mode: DeviceMode) -> Updater<SimDevice> {
        Updater::new(sim, mode)
            .with_profile(quick_profile())
            .with_ble_profile(TransferProfile {
                payload_delay: Duration::ZERO,
                activation_delay: Duration::ZERO,
                chunk_timeout: Duration::from_millis(20),
                ..TransferProfile::ble()
            })
            .with_timeouts(quick_timeouts())
    }

    /// Radio reporting `old` until the first `BLE_DFU`, then `new`.
    fn radio_device(old: &'static str, new: &'static str) -> SimDevice {
        let mut updated = false;
        SimDevice::new(move |cmd, _| {
            Some(match cmd {
                "FW_UPDATE BLE_DFU" => {
                    updated = true;
                    pass("FW_UPDATE", "{}")
                },
                "BLE GET_SW_VER" => {
                    let version = if updated { new } else { old };
                    pass("BLE", &format!(r#"{{"FW_VER": "{version}"}}"#))
                },
                c => pass(module_of(c), "{}"),
            })
        })
    }

    fn position(commands: &[String], wanted: &str) -> usize {
        commands
            .iter()
            .position(|c| c == wanted)
            .unwrap_or_else(|| panic!("{wanted} was never sent"))
    }

    fn image(name: &str) -> BinaryImage {
        BinaryImage::from_bytes(name, vec![1; 20]).unwrap()
    }

    fn request(names: &[&str]) -> UpdateRequest {
        UpdateRequest::from_images(
            names
                .iter()
                .map(|n| image(n))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_update_across_record_runs_bootloader_then_application() {
        let mut updater = updater(
            versions_device(r#"{"BTL": 4005, "TG_APP": 4005}"#),
            DeviceMode::TgApp,
        );
        let mut warnings = 0;
        updater
            .update(
                request(&["lbb_mcu_4011.bin", "lbb_mcu_bootloader_4011.bin"]),
                &mut |_| {
                    warnings += 1;
                    true
                },
                &mut |_, _, _| {},
            )
            .unwrap();

        assert_eq!(warnings, 1);
        assert_eq!(
            updater
                .link()
                .port()
                .commands,
            vec![
                "SYS FW_VER",
                "EEPROM WRITE 0 2234",
                "EEPROM WRITE 2000 1234",
                "FW_UPDATE WR_BTL_FW_INFO 20 14 ff01 8000 0",
                "QSPI SEC_ER 2 10000",
                "FW_UPDATE WR_FW 14 8000 20",
                "FW_UPDATE UPDATE_BTL",
                "EEPROM WRITE 0 2234",
                "EEPROM WRITE 2000 1234",
                "FW_UPDATE WR_MCU_FW_INFO 20 14 ff01 158000 2",
                "QSPI SEC_ER 2 160000",
                "FW_UPDATE WR_FW 14 158000 20",
                "FW_UPDATE SET_MCU_FW_UPDATE_FLAG",
                "SYS REBOOT",
            ]
        );
    }

    #[test]
    fn test_rejected_plan_sends_nothing_after_version_query() {
        let mut updater = updater(
            versions_device(r#"{"BTL": 4005, "TG_APP": 4005}"#),
            DeviceMode::TgApp,
        );
        let err = updater
            .update(
                request(&["lbb_mcu_4011.bin"]),
                &mut |_| true,
                &mut |_, _, _| {},
            )
            .unwrap_err();
        assert!(matches!(
            err,
            Error::PlanRejected(Rejection::ApplicationAloneAcrossRecord { .. })
        ));
        assert_eq!(
            updater
                .link()
                .port()
                .commands,
            vec!["SYS FW_VER"]
        );
    }

    #[test]
    fn test_declined_warning_stops_before_bootloader_commit() {
        let mut updater = updater(
            versions_device(r#"{"BTL": 4011, "CLI": 4011}"#),
            DeviceMode::Factory,
        );
        let err = updater
            .update(
                request(&["lbb_mcu_bootloader_4012.bin", "lbb_mcu_factory_4012.bin"]),
                &mut |warning| {
                    assert_eq!(warning, BOOTLOADER_WARNING);
                    false
                },
                &mut |_, _, _| {},
            )
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled(_)));
        let sim = updater
            .link()
            .port();
        assert!(
            sim.commands_starting_with("FW_UPDATE UPDATE_BTL")
                .is_empty()
        );
        assert!(
            sim.commands_starting_with("FW_UPDATE WR_MCU_FW_INFO")
                .is_empty()
        );
    }

    #[test]
    fn test_bootloader_only_update_reboots() {
        let mut updater = updater(
            versions_device(r#"{"BTL": 4011, "TG_APP": 4013}"#),
            DeviceMode::TgApp,
        );
        let mut sent = Vec::new();
        updater
            .update(
                request(&["lbb_mcu_bootloader_4012.bin"]),
                &mut |_| true,
                &mut |name, done, total| sent.push((name.to_string(), done, total)),
            )
            .unwrap();

        assert_eq!(
            sent,
            vec![("lbb_mcu_bootloader_4012.bin".to_string(), 20, 20)]
        );
        let commands = &updater
            .link()
            .port()
            .commands;
        assert_eq!(
            &commands[commands.len() - 2..],
            ["FW_UPDATE UPDATE_BTL", "SYS REBOOT"]
        );
    }

    #[test]
    fn test_chunk_failure_aborts_plan() {
        let sim = SimDevice::new(|cmd, _| {
            Some(match cmd {
                "SYS FW_VER" => pass("SYS", r#"{"BTL": 4011, "CLI": 4011}"#),
                c if c.starts_with("FW_UPDATE WR_FW") => fail("FW_UPDATE", 3),
                c => pass(module_of(c), "{}"),
            })
        });
        let mut updater = updater(sim, DeviceMode::Factory);
        let err = updater
            .update(
                request(&["lbb_mcu_factory_4012.bin"]),
                &mut |_| true,
                &mut |_, _, _| {},
            )
            .unwrap_err();

        assert!(matches!(err, Error::ChunkFailed { attempts: 3, .. }));
        let sim = updater
            .link()
            .port();
        assert_eq!(
            sim.commands_starting_with("FW_UPDATE WR_FW")
                .len(),
            3
        );
        assert!(
            sim.commands_starting_with("FW_UPDATE SET_MCU_FW_UPDATE_FLAG")
                .is_empty()
        );
    }

    #[test]
    fn test_rebooting_step_waits_for_banner_before_next_step() {
        let sim = SimDevice::new(|cmd, _| match cmd {
            "SYS REBOOT" => Some("\r\nWelcome to factory CLI\r\n".to_string()),
            c => Some(pass(module_of(c), "{}")),
        });
        let record = DEPENDENCY_TABLE[0];
        let plan = TransferPlan::new(vec![
            PlanStep::application(image("lbb_mcu_factory_4011.bin"), record),
            PlanStep::application(image("lbb_mcu_4011.bin"), record),
        ]);
        let mut updater = updater(sim, DeviceMode::TgApp);
        updater
            .run_plan(&plan, &mut |_| true, &mut |_, _, _| {})
            .unwrap();

        assert_eq!(updater.mode(), DeviceMode::TgApp);
        assert_eq!(
            updater
                .link()
                .port()
                .commands_starting_with("SYS REBOOT")
                .len(),
            2
        );
    }

    #[test]
    fn test_reboot_into_tg_app_handshakes_before_next_step() {
        let sim = SimDevice::new(|cmd, _| match cmd {
            "SYS REBOOT" => Some(format!(
                "\r\n{}\r\n{}\r\n",
                device::TG_APP_BANNER,
                device::HANDSHAKE_PROMPT
            )),
            c if c == device::HANDSHAKE_REPLY => Some(format!("\r\n{}\r\n", device::CLI_BANNER)),
            c => Some(pass(module_of(c), "{}")),
        });
        let record = DEPENDENCY_TABLE[0];
        let plan = TransferPlan::new(vec![
            PlanStep::application(image("lbb_mcu_4011.bin"), record),
            PlanStep::application(image("lbb_mcu_factory_4011.bin"), record),
        ]);
        let mut updater = updater(sim, DeviceMode::Factory);
        updater
            .run_plan(&plan, &mut |_| true, &mut |_, _, _| {})
            .unwrap();

        let commands = &updater
            .link()
            .port()
            .commands;
        let reboot = position(commands, "SYS REBOOT");
        let reply = position(commands, device::HANDSHAKE_REPLY);
        assert_eq!(reply, reboot + 1);

        let announces: Vec<usize> = commands
            .iter()
            .enumerate()
            .filter(|(_, c)| c.starts_with("FW_UPDATE WR_MCU_FW_INFO"))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(announces.len(), 2);
        assert!(announces[0] < reboot);
        assert!(announces[1] > reply);
        assert_eq!(commands[reply + 1], "EEPROM WRITE 0 2234");
        assert_eq!(updater.mode(), DeviceMode::Factory);
    }

    #[test]
    fn test_reboot_into_tg_app_without_cli_banner_stops() {
        let sim = SimDevice::new(|cmd, _| match cmd {
            "SYS REBOOT" => Some(format!(
                "\r\n{}\r\n{}\r\n",
                device::TG_APP_BANNER,
                device::HANDSHAKE_PROMPT
            )),
            c if c == device::HANDSHAKE_REPLY => None,
            c => Some(pass(module_of(c), "{}")),
        });
        let record = DEPENDENCY_TABLE[0];
        let plan = TransferPlan::new(vec![
            PlanStep::application(image("lbb_mcu_4011.bin"), record),
            PlanStep::application(image("lbb_mcu_factory_4011.bin"), record),
        ]);
        let mut updater = updater(sim, DeviceMode::Factory);
        let err = updater
            .run_plan(&plan, &mut |_| true, &mut |_, _, _| {})
            .unwrap_err();

        assert!(matches!(err, Error::Handshake(_)));
        let sim = updater
            .link()
            .port();
        assert_eq!(
            sim.commands
                .last()
                .map(String::as_str),
            Some(device::HANDSHAKE_REPLY)
        );
        assert_eq!(
            sim.commands_starting_with("FW_UPDATE WR_MCU_FW_INFO")
                .len(),
            1
        );
    }

    #[test]
    fn test_missing_boot_banner_aborts_remaining_steps() {
        let record = DEPENDENCY_TABLE[0];
        let plan = TransferPlan::new(vec![
            PlanStep::application(image("lbb_mcu_factory_4011.bin"), record),
            PlanStep::application(image("lbb_mcu_4011.bin"), record),
        ]);
        let mut updater = updater(SimDevice::passing(), DeviceMode::TgApp);
        let err = updater
            .run_plan(&plan, &mut |_| true, &mut |_, _, _| {})
            .unwrap_err();

        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(
            updater
                .link()
                .port()
                .commands_starting_with("FW_UPDATE WR_MCU_FW_INFO")
                .len(),
            1
        );
    }

    #[test]
    fn test_connect_depends_on_mode() {
        let mut factory = updater(SimDevice::passing(), DeviceMode::Factory);
        factory
            .connect()
            .unwrap();
        assert!(
            factory
                .link()
                .port()
                .commands
                .is_empty()
        );

        let mut tg_app = updater(SimDevice::new(|_, _| None), DeviceMode::TgApp);
        assert!(matches!(tg_app.connect(), Err(Error::Handshake(_))));
    }

    #[test]
    fn test_smt_simulation_flow() {
        let mut updater = updater(
            versions_device(r#"{"BTL": 4011, "CLI": 4011}"#),
            DeviceMode::Factory,
        );
        updater
            .smt_simulate(
                vec![
                    (image("lbb_mcu_factory_4011.bin"), 20),
                    (image("lbb_mcu_4012.bin"), 20),
                ],
                &mut |_, _, _| {},
            )
            .unwrap();

        let sim = updater
            .link()
            .port();
        assert_eq!(sim.commands[1], "EXMEM FORMAT");
        assert_eq!(
            sim.commands_starting_with("FW_UPDATE WR_MCU_FW_INFO"),
            vec![
                "FW_UPDATE WR_MCU_FW_INFO 20 14 ff01 18000 2",
                "FW_UPDATE WR_MCU_FW_INFO 20 14 ff01 158000 2",
            ]
        );
        assert_eq!(
            sim.commands_starting_with("FW_UPDATE VER_MCU_CHECKSUM")
                .len(),
            2
        );
        assert!(
            sim.commands_starting_with("QSPI")
                .is_empty()
        );
        assert!(
            sim.commands_starting_with("SYS REBOOT")
                .is_empty()
        );
    }

    #[test]
    fn test_smt_checksum_mismatch_sends_nothing() {
        let mut updater = updater(
            versions_device(r#"{"BTL": 4011, "CLI": 4011}"#),
            DeviceMode::Factory,
        );
        let err = updater
            .smt_simulate(
                vec![
                    (image("lbb_mcu_factory_4011.bin"), 21),
                    (image("lbb_mcu_4012.bin"), 20),
                ],
                &mut |_, _, _| {},
            )
            .unwrap_err();
        assert!(matches!(
            err,
            Error::PlanRejected(Rejection::ChecksumMismatch { .. })
        ));
        assert_eq!(
            updater
                .link()
                .port()
                .commands,
            vec!["SYS FW_VER"]
        );
    }

    #[test]
    fn test_ble_update_reads_version_before_and_after() {
        let package = BlePackage::from_bytes(&ble_zip()).unwrap();
        let mut updater = updater(radio_device("1.2.0", "1.3.0"), DeviceMode::Factory);
        let report = updater
            .update_ble(&package, &mut |_, _, _| {})
            .unwrap();

        assert_eq!(
            report,
            BleUpdateReport {
                before: Some("1.2.0".to_string()),
                after: vec![Some("1.3.0".to_string())],
            }
        );
        let commands = &updater
            .link()
            .port()
            .commands;
        assert_eq!(commands[0], "BLE GET_SW_VER");
        assert_eq!(
            &commands[commands.len() - 2..],
            ["FW_UPDATE BLE_DFU", "BLE GET_SW_VER"]
        );
    }

    #[test]
    fn test_ble_update_alternates_packages() {
        let second_manifest = br#"{"manifest": {
            "application": {"dat_file": "app.dat", "bin_file": "app.bin"}
        }}"#;
        let second = BlePackage::from_bytes(&make_zip(&[
            ("manifest.json", second_manifest),
            ("app.dat", &[5; 8]),
            ("app.bin", &[6; 50]),
        ]))
        .unwrap();
        let first = BlePackage::from_bytes(&ble_zip()).unwrap();

        let mut updater = updater(radio_device("1.2.0", "1.3.0"), DeviceMode::Factory);
        let report = updater
            .update_ble_alternating(&first, Some(&second), 2, &mut |_, _, _| {})
            .unwrap();

        assert_eq!(
            report
                .after
                .len(),
            3
        );
        let sim = updater
            .link()
            .port();
        let apps = sim.commands_starting_with("FW_UPDATE WR_BLE_DFU_INFO APP");
        assert_eq!(apps.len(), 3);
        assert!(apps[0].contains(" 300 "));
        assert!(apps[1].contains(" 50 "));
        assert!(apps[2].contains(" 300 "));
        assert_eq!(
            sim.commands_starting_with("FW_UPDATE WR_BLE_DFU_INFO SD")
                .len(),
            2
        );
        assert_eq!(
            sim.commands_starting_with("FW_UPDATE BLE_DFU")
                .len(),
            3
        );
        assert_eq!(
            sim.commands_starting_with("BLE GET_SW_VER")
                .len(),
            4
        );
    }

    #[test]
    fn test_ble_update_without_second_package_repeats_first() {
        let package = BlePackage::from_bytes(&ble_zip()).unwrap();
        let mut updater = updater(radio_device("1.2.0", "1.3.0"), DeviceMode::Factory);
        updater
            .update_ble_alternating(&package, None, 1, &mut |_, _, _| {})
            .unwrap();
        let apps = updater
            .link()
            .port()
            .commands_starting_with("FW_UPDATE WR_BLE_DFU_INFO APP");
        assert_eq!(apps.len(), 2);
        assert_eq!(apps[0], apps[1]);
    }

    #[test]
    fn test_unreported_ble_version_does_not_stop_update() {
        let sim = SimDevice::new(|cmd, _| {
            Some(match cmd {
                "BLE GET_SW_VER" => fail("BLE", 1),
                c => pass(module_of(c), "{}"),
            })
        });
        let package = BlePackage::from_bytes(&ble_zip()).unwrap();
        let mut updater = updater(sim, DeviceMode::Factory);
        let report = updater
            .update_ble(&package, &mut |_, _, _| {})
            .unwrap();

        assert_eq!(report.before, None);
        assert_eq!(report.after, vec![None]);
        assert_eq!(
            updater
                .link()
                .port()
                .commands_starting_with("FW_UPDATE BLE_DFU")
                .len(),
            1
        );
    }

    #[test]
    fn test_close_and_into_port() {
        let mut updater = updater(SimDevice::passing(), DeviceMode::Factory);
        updater
            .close()
            .unwrap();
        assert!(
            updater
                .into_port()
                .closed
        );
    }
}
