impl<P: Platform> SleepCoordinator<P> {
    /// Works out how long to sleep and whether the modem stays registered.
    fn calculate_sleep(&mut self, is_connected: bool) {
        let mut config = SleepConfiguration::default();
        let mut params = SleepParameters {
            is_connected,
            sleep_time_ms: self.config.default_sleep_ms,
            time_until_next_full_wake_ms: self.config.default_sleep_ms,
            next_full_wake_time: None,
            calculated_millis: 0,
            disconnect_cellular: true,
        };

        if self.platform.is_valid() {
            let now = self.platform.now();
            if let Some(next) = self.schedules.next_wake(now) {
                params.sleep_time_ms = seconds_to_ms(next.time - now);
            }
            params.next_full_wake_time = self.schedules.next_full_wake(now);
            params.time_until_next_full_wake_ms = match params.next_full_wake_time {
                Some(full_wake) => seconds_to_ms(full_wake - now),
                None => params.sleep_time_ms,
            };
        }
        params.disconnect_cellular =
            params.time_until_next_full_wake_ms >= self.config.minimum_cellular_off_ms;

        self.sleep_configuration_hooks
            .for_each(|hook| hook(&mut config, &mut params));

        params.sleep_time_ms = params.sleep_time_ms.max(self.config.sleep_floor_ms);
        params.calculated_millis = self.platform.millis();
        config.network_standby = is_connected && !params.disconnect_cellular;
        config.duration_ms = params.sleep_time_ms;

        info!(
            "cycle: sleep plan ms={} full_wake_in_ms={} disconnect_cellular={}",
            params.sleep_time_ms, params.time_until_next_full_wake_ms, params.disconnect_cellular
        );
        self.sleep_config = config;
        self.sleep_params = params;
    }

    /// Runs on every tick regardless of state.
    fn data_capture_handler(&mut self) {
        if self.data_capture_hooks.is_empty()
            || !self.platform.is_valid()
            || self.schedules.is_empty(DATA_SCHEDULE)
        {
            return;
        }

        if self.data_capture_active {
            if !self
                .data_capture_hooks
                .while_any_true(|hook, state| hook(state))
            {
                debug!("cycle: data capture done");
                self.data_capture_active = false;
            }
            return;
        }

        let now = self.platform.now();
        let next_capture = self.persistent.next_data_capture();
        if next_capture != 0 && next_capture > now {
            return;
        }
        if next_capture != 0 {
            debug!("cycle: data capture due at {}", next_capture);
            self.data_capture_hooks.set_start_state();
            self.data_capture_active = true;
        }
        if let Some(next) = self.schedules.next_data_capture(now) {
            self.persistent.set_next_data_capture(next);
        }
    }
}

fn seconds_to_ms(seconds: i64) -> u64 {
    u64::try_from(seconds).map_or(0, |seconds| seconds.saturating_mul(1_000))
}
