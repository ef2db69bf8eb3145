impl<P: Platform> SleepCoordinator<P> {
    /// Runs once from [`SleepCoordinator::setup`], before wake-or-boot hooks.
    pub fn with_setup_hook(&mut self, hook: impl FnMut() -> bool + Send + 'static) -> &mut Self {
        self.setup_hooks.add(Box::new(hook));
        self
    }

    /// Runs at the top of every tick.
    pub fn with_loop_hook(&mut self, hook: impl FnMut() -> bool + Send + 'static) -> &mut Self {
        self.loop_hooks.add(Box::new(hook));
        self
    }

    /// Called every tick while a capture is in progress; return `false` when done.
    pub fn with_data_capture_hook(
        &mut self,
        hook: impl FnMut(&mut HookState) -> bool + Send + 'static,
    ) -> &mut Self {
        self.data_capture_hooks.add(Box::new(hook));
        self
    }

    /// Keeps the device connected while it returns `true`. The second argument is
    /// milliseconds since the cloud session came up.
    pub fn with_sleep_ready_hook(
        &mut self,
        hook: impl FnMut(&mut HookState, u64) -> bool + Send + 'static,
    ) -> &mut Self {
        self.sleep_ready_hooks.add(Box::new(hook));
        self
    }

    /// Keeps a quick wake awake while it returns `true`.
    pub fn with_no_connection_hook(
        &mut self,
        hook: impl FnMut(&mut HookState) -> bool + Send + 'static,
    ) -> &mut Self {
        self.no_connection_hooks.add(Box::new(hook));
        self
    }

    /// Votes on connecting this wake by raising either conviction (0..=100).
    pub fn with_should_connect_hook(
        &mut self,
        hook: impl FnMut(&mut i32, &mut i32) + Send + 'static,
    ) -> &mut Self {
        self.should_connect_hooks.add(Box::new(hook));
        self
    }

    pub fn with_wake_or_boot_hook(
        &mut self,
        hook: impl FnMut(i32) -> bool + Send + 'static,
    ) -> &mut Self {
        self.wake_or_boot_hooks.add(Box::new(hook));
        self
    }

    /// Runs before sleeping (`false`) or on a reset request (`true`).
    pub fn with_sleep_or_reset_hook(
        &mut self,
        hook: impl FnMut(bool) -> bool + Send + 'static,
    ) -> &mut Self {
        self.sleep_or_reset_hooks.add(Box::new(hook));
        self
    }

    /// Connecting gives up once any of these returns `false`.
    pub fn with_maximum_time_to_connect_hook(
        &mut self,
        hook: impl FnMut(u64) -> bool + Send + 'static,
    ) -> &mut Self {
        self.maximum_time_to_connect_hooks.add(Box::new(hook));
        self
    }

    pub fn with_maximum_time_to_connect(&mut self, limit_ms: u64) -> &mut Self {
        self.with_maximum_time_to_connect_hook(move |elapsed_ms| elapsed_ms < limit_ms)
    }

    /// Stays connected for at least `minimum_ms` after the cloud session comes up.
    pub fn with_minimum_connected_time(&mut self, minimum_ms: u64) -> &mut Self {
        self.with_sleep_ready_hook(move |_, connected_ms| connected_ms < minimum_ms)
    }

    pub fn with_sleep_configuration_hook(
        &mut self,
        hook: impl FnMut(&mut SleepConfiguration, &mut SleepParameters) -> bool + Send + 'static,
    ) -> &mut Self {
        self.sleep_configuration_hooks.add(Box::new(hook));
        self
    }

    /// Runs right after the sleep primitive returns.
    pub fn with_wake_hook(
        &mut self,
        hook: impl FnMut(&SleepResult) -> bool + Send + 'static,
    ) -> &mut Self {
        self.wake_hooks.add(Box::new(hook));
        self
    }

    pub fn with_setting_change_hook(
        &mut self,
        hook: impl FnMut(&str) -> bool + Send + 'static,
    ) -> &mut Self {
        self.settings.add_setting_change_hook(hook);
        self
    }

    pub fn with_wake_event_hook(
        &mut self,
        hook: impl FnMut(&mut JsonObjectWriter, &mut i32) -> bool + Send + 'static,
    ) -> &mut Self {
        self.combiner.add_hook(hook);
        self
    }

    /// Contributes to the next combined wake event only.
    pub fn with_wake_event_one_time_hook(
        &mut self,
        hook: impl FnMut(&mut JsonObjectWriter, &mut i32) -> bool + Send + 'static,
    ) -> &mut Self {
        self.combiner.add_one_time_hook(hook);
        self
    }

    /// Votes against connecting while the battery is below `minimum_soc` percent.
    /// Ignored when no gauge reports a charge.
    pub fn with_should_connect_minimum_soc(&mut self, minimum_soc: f32, conviction: i32) -> &mut Self {
        self.minimum_soc = Some((minimum_soc, conviction.clamp(0, 100)));
        self
    }

    pub fn with_time_zone(&mut self, posix: &str) -> Result<&mut Self, ScheduleError> {
        self.schedules.set_posix_time_zone(posix)?;
        self.config.time_zone = posix.to_owned();
        Ok(self)
    }

    /// Stores one JSON object in the event history for the next full wake.
    pub fn add_event(&mut self, json: &str) -> Result<(), HistoryError> {
        if self.log_enabled(LogFlags::HISTORY_DATA) {
            trace!("cycle: history event {}", json);
        }
        self.history.append(json)
    }

    pub fn add_event_with(
        &mut self,
        build: impl FnOnce(&mut JsonObjectWriter),
    ) -> Result<(), HistoryError> {
        let trace_data = self.log_enabled(LogFlags::HISTORY_DATA);
        self.history.append_with(|writer| {
            build(writer);
            if trace_data {
                trace!("cycle: history event {}", writer.to_json());
            }
        })
    }
}
