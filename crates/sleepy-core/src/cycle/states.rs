impl<P: Platform> SleepCoordinator<P> {
    fn state_start(&mut self) {
        let now = self.platform.now();
        let time_valid = self.platform.is_valid();
        let before_full_wake = time_valid
            && self
                .sleep_params
                .next_full_wake_time
                .is_some_and(|full_wake| now < full_wake);

        if before_full_wake || !self.connect_vote(now, time_valid).should_connect() {
            info!("cycle: quick wake");
            if time_valid {
                self.persistent.set_last_quick_wake(now);
            }
            self.no_connection_hooks.set_start_state();
            self.set_state(CycleState::NoConnection);
            return;
        }

        info!("cycle: full wake, connecting");
        let now_ms = self.platform.millis();
        self.platform.connect();
        self.connect_attempt_start_ms = now_ms;
        self.network_connected_ms = None;
        self.set_state(CycleState::ConnectWait);
    }

    fn connect_vote(&mut self, now: i64, time_valid: bool) -> ConnectVote {
        let mut vote = ConnectVote::default();
        if !time_valid {
            vote.connect = BUILTIN_CONVICTION;
        } else {
            let last_full_wake = self.persistent.last_full_wake();
            let full_wake_due = last_full_wake == 0
                || self
                    .schedules
                    .next_full_wake(last_full_wake)
                    .is_none_or(|full_wake| full_wake <= now);
            if full_wake_due {
                vote.connect = BUILTIN_CONVICTION;
            }
        }

        if let Some((minimum_soc, conviction)) = self.minimum_soc
            && let Some(soc) = self.platform.battery_charge()
            && soc < minimum_soc
        {
            debug!("cycle: soc={:.1} below minimum {:.1}", soc, minimum_soc);
            vote.no_connect = conviction;
        }

        let vote = self.should_connect_hooks.vote_with(vote);
        debug!(
            "cycle: connect vote connect={} no_connect={}",
            vote.connect, vote.no_connect
        );
        vote
    }

    fn connect_time_exhausted(&mut self, elapsed_ms: u64) -> bool {
        !self
            .maximum_time_to_connect_hooks
            .until_false(true, |hook| hook(elapsed_ms))
    }

    fn state_connect_wait(&mut self) {
        let now_ms = self.platform.millis();
        let elapsed_ms = now_ms.saturating_sub(self.connect_attempt_start_ms);

        if self.network_connected_ms.is_none() && self.platform.ready() {
            info!("cycle: network ready after {} ms", elapsed_ms);
            self.network_connected_ms = Some(now_ms);
        }

        if self.platform.cloud_connected() {
            info!("cycle: cloud connected after {} ms", elapsed_ms);
            self.connected_start_ms = now_ms;
            self.set_state(CycleState::TimeValidWait);
            return;
        }

        if self.connect_time_exhausted(elapsed_ms) {
            warn!("cycle: gave up connecting after {} ms", elapsed_ms);
            self.set_state(CycleState::DisconnectBeforeSleep);
        }
    }

    fn state_time_valid_wait(&mut self) {
        if self.platform.is_valid() {
            self.set_state(CycleState::ConnectedStart);
        }
    }

    fn state_connected_start(&mut self) {
        self.persistent.set_last_full_wake(self.platform.now());

        let time_to_connect = self
            .connected_start_ms
            .saturating_sub(self.connect_attempt_start_ms);
        self.combiner
            .add_flag_fragment(WakeEventFlags::TIME_TO_CONNECT, time_to_connect);

        if let Some(soc) = self.platform.battery_charge()
            && soc > 0.0
        {
            let soc = (f64::from(soc) * 10.0).round() / 10.0;
            self.combiner
                .add_flag_fragment(WakeEventFlags::BATTERY_SOC, soc);
        }
        self.set_state(CycleState::ConnectedWakeEvents);
    }

    fn state_connected_wake_events(&mut self) {
        if self.data_capture_active {
            return;
        }

        // History riding in retained items is drained again below.
        self.publish_queue.retain(|item| item.history_end.is_none());
        self.wake_event_payloads = self.combiner.generate_events();
        debug!(
            "cycle: {} wake event payloads, {} retained publishes",
            self.wake_event_payloads.len(),
            self.publish_queue.len()
        );
        self.sleep_ready_hooks.set_start_state();
        self.set_state(CycleState::Connected);
    }

    fn stage_wake_event_payloads(&mut self) {
        if self.wake_event_payloads.is_empty() {
            return;
        }
        if self.config.wake_event_name.is_empty() {
            debug!(
                "cycle: wake events disabled, {} payloads dropped",
                self.wake_event_payloads.len()
            );
            self.wake_event_payloads.clear();
            return;
        }
        for payload in self.wake_event_payloads.drain(..) {
            let mut item = PublishItem::new(
                &self.config.wake_event_name,
                payload.data,
                self.config.publish_flags,
            );
            item.history_end = payload.history_end;
            self.publish_queue.push_back(item);
        }
    }

    fn state_connected(&mut self) {
        let now_ms = self.platform.millis();
        if !self.platform.cloud_connected() {
            info!("cycle: cloud session lost, reconnecting");
            self.platform.connect();
            self.reconnect_attempt_start_ms = now_ms;
            self.set_state(CycleState::ReconnectWait);
            return;
        }

        self.stage_wake_event_payloads();

        let log_publish = self.log_enabled(LogFlags::PUBLISH);
        let log_data = self.log_enabled(LogFlags::PUBLISH_DATA);
        if let Some(item) = self.publish_queue.front() {
            if log_publish {
                info!(
                    "cycle: publish name={} bytes={} queued={}",
                    item.name,
                    item.data.len(),
                    self.publish_queue.len()
                );
            }
            if log_data {
                trace!("cycle: publish data {}", item.data);
            }

            let completion = PublishCompletion::new();
            if !self.platform.publish(item, completion.clone()) {
                warn!("cycle: publish refused, retrying");
                return;
            }
            self.publish_completion = Some(completion);
            self.state_time_ms = now_ms;
            self.set_state(CycleState::PublishWait);
            return;
        }

        let connected_ms = now_ms.saturating_sub(self.connected_start_ms);
        let hooks_awake = self
            .sleep_ready_hooks
            .while_any_true(|hook, state| hook(state, connected_ms));
        if hooks_awake || !self.platform.is_valid() || self.firmware_update_in_progress {
            return;
        }

        info!("cycle: ready to sleep after {} ms connected", connected_ms);
        self.set_state(CycleState::DisconnectBeforeSleep);
    }

    fn state_publish_wait(&mut self) {
        let Some(ok) = self
            .publish_completion
            .as_ref()
            .and_then(PublishCompletion::poll)
        else {
            return;
        };
        self.publish_completion = None;

        if ok {
            if let Some(item) = self.publish_queue.pop_front()
                && let Some(end) = item.history_end
            {
                self.combiner.acknowledge(end);
            }
        } else {
            warn!(
                "cycle: publish failed, {} items kept queued",
                self.publish_queue.len()
            );
        }
        self.state_time_ms = self.platform.millis();
        self.set_state(CycleState::PublishRateLimit);
    }

    fn state_publish_rate_limit(&mut self) {
        let elapsed_ms = self.platform.millis().saturating_sub(self.state_time_ms);
        if elapsed_ms >= self.config.publish_rate_limit_ms {
            self.set_state(CycleState::Connected);
        }
    }

    fn state_reconnect_wait(&mut self) {
        if self.platform.cloud_connected() {
            info!("cycle: cloud reconnected");
            self.set_state(CycleState::Connected);
            return;
        }

        let elapsed_ms = self
            .platform
            .millis()
            .saturating_sub(self.reconnect_attempt_start_ms);
        if self.connect_time_exhausted(elapsed_ms) {
            warn!("cycle: gave up reconnecting after {} ms", elapsed_ms);
            self.set_state(CycleState::DisconnectBeforeSleep);
        }
    }

    fn state_no_connection(&mut self) {
        if self.data_capture_active {
            return;
        }
        if self.no_connection_hooks.while_any_true(|hook, state| hook(state)) {
            return;
        }
        self.set_state(CycleState::DisconnectBeforeSleep);
    }

    fn state_disconnect_before_sleep(&mut self) {
        let is_connected = !self.platform.is_off();
        self.calculate_sleep(is_connected);

        if !is_connected || !self.sleep_params.disconnect_cellular {
            self.set_state(CycleState::Sleep);
            return;
        }

        self.platform.disconnect(self.config.graceful_disconnect_ms);
        self.state_time_ms = self.platform.millis();
        self.set_state(CycleState::DisconnectWait);
    }

    fn state_disconnect_wait(&mut self) {
        let elapsed_ms = self.platform.millis().saturating_sub(self.state_time_ms);
        let budget_spent = elapsed_ms >= u64::from(self.config.graceful_disconnect_ms);
        if !self.platform.disconnected() && !budget_spent {
            return;
        }
        if budget_spent {
            warn!("cycle: graceful disconnect timed out");
        }
        self.platform.network_disconnect();
        self.set_state(CycleState::WaitRadioDisconnected);
    }

    fn state_wait_radio_disconnected(&mut self) {
        if !self.platform.ready() {
            self.platform.off();
            self.set_state(CycleState::WaitRadioOff);
        }
    }

    fn state_wait_radio_off(&mut self) {
        if self.platform.is_off() {
            self.set_state(CycleState::Sleep);
        }
    }

    fn state_sleep(&mut self) {
        self.run_sleep_or_reset(false);

        let now_ms = self.platform.millis();
        let elapsed_ms = now_ms.saturating_sub(self.sleep_params.calculated_millis);
        let remaining_ms = self.sleep_params.sleep_time_ms.saturating_sub(elapsed_ms);
        self.sleep_config.duration_ms = remaining_ms;

        if remaining_ms < self.config.minimum_sleep_ms {
            debug!("cycle: {} ms too short to sleep, waiting", remaining_ms);
            self.wake_reason = WAKEUP_REASON_NO_SLEEP;
            self.state_time_ms = now_ms;
            self.set_state(CycleState::SleepShort);
            return;
        }

        info!(
            "cycle: sleep ms={} standby={}",
            remaining_ms, self.sleep_config.network_standby
        );
        let result = self.platform.sleep(&self.sleep_config);
        self.wake_hooks.for_each(|hook| hook(&result));
        self.wake_reason = result.wake_reason;
        self.set_state(CycleState::SleepDone);
    }

    fn state_sleep_short(&mut self) {
        let elapsed_ms = self.platform.millis().saturating_sub(self.state_time_ms);
        if elapsed_ms >= self.sleep_config.duration_ms {
            self.set_state(CycleState::SleepDone);
        }
    }

    fn state_sleep_done(&mut self) {
        let wake_reason = self.wake_reason;
        info!("cycle: woke reason={}", wake_reason);
        self.wake_or_boot_hooks.for_each(|hook| hook(wake_reason));
        self.combiner
            .add_flag_fragment(WakeEventFlags::WAKE_REASON, wake_reason);
        self.set_state(CycleState::Start);
    }
}
