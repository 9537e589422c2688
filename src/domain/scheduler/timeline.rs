use crate::domain::device::Device;

/// Planning-time occupancy of one device: booked operation windows plus
/// container residency over time. The scheduler builds one per device from
/// the snapshot and books candidate placements into it as it goes.
#[derive(Debug, Clone)]
pub struct DeviceTimeline {
    pub device: Device,

    /// Booked operation windows, one entry per concurrent operation.
    ops: Vec<(i64, i64)>,

    /// Container residency change events `(time, delta)`.
    residency: Vec<(i64, i32)>,
}

impl DeviceTimeline {
    pub fn new(device: Device, initial_containers: u32, at: i64) -> DeviceTimeline {
        let mut residency = Vec::new();
        if initial_containers > 0 {
            residency.push((at, initial_containers as i32));
        }
        DeviceTimeline { device, ops: Vec::new(), residency }
    }

    pub fn book_operation(&mut self, start: i64, end: i64) {
        self.ops.push((start, end));
    }

    pub fn add_residency(&mut self, time: i64, delta: i32) {
        self.residency.push((time, delta));
    }

    /// Containers resident at instant `t`.
    pub fn container_count_at(&self, t: i64) -> i32 {
        self.residency.iter().filter(|(time, _)| *time <= t).map(|(_, delta)| delta).sum()
    }

    /// Peak container residency over `[start, end)`.
    pub fn max_containers_in(&self, start: i64, end: i64) -> i32 {
        let mut peak = self.container_count_at(start);
        let mut current = peak;
        let mut events: Vec<(i64, i32)> = self.residency.iter().filter(|(t, _)| *t > start && *t < end).copied().collect();
        events.sort();
        for (_, delta) in events {
            current += delta;
            peak = peak.max(current);
        }
        peak
    }

    /// Peak number of concurrently running booked operations over `[start, end)`.
    pub fn max_ops_in(&self, start: i64, end: i64) -> u32 {
        let mut events: Vec<(i64, i32)> = Vec::new();
        for &(s, e) in &self.ops {
            if s < end && e > start {
                events.push((s.max(start), 1));
                events.push((e.min(end), -1));
            }
        }
        events.sort();
        let mut current = 0;
        let mut peak = 0;
        for (_, delta) in events {
            current += delta;
            peak = peak.max(current);
        }
        peak as u32
    }

    /// Whether `ops_to_add` operations bringing `arriving` containers fit in
    /// the window under this device's capacity model.
    pub fn fits(&self, start: i64, duration: i64, ops_to_add: u32, arriving: u32) -> bool {
        let end = start + duration.max(1);

        let concurrent_ops = self.max_ops_in(start, end);
        if !self.device.allows_overlap && concurrent_ops > 0 {
            return false;
        }
        if concurrent_ops + ops_to_add > self.device.process_capacity {
            return false;
        }

        let peak_containers = self.max_containers_in(start, end);
        if peak_containers + arriving as i32 > self.device.capacity as i32 {
            return false;
        }

        true
    }

    /// Earliest start `>= not_before` where the booking fits.
    ///
    /// # Returns
    /// `None` when the device can never take the booking (e.g. the arriving
    /// containers exceed its capacity outright).
    pub fn earliest_fit(&self, not_before: i64, duration: i64, ops_to_add: u32, arriving: u32) -> Option<i64> {
        if arriving > self.device.capacity || ops_to_add > self.device.process_capacity {
            return None;
        }
        if self.device.capacity == 0 || self.device.process_capacity == 0 {
            return None;
        }

        let mut candidates: Vec<i64> = vec![not_before];
        for (_, end) in &self.ops {
            if *end > not_before {
                candidates.push(*end);
            }
        }
        for (time, _) in &self.residency {
            if *time > not_before {
                candidates.push(*time);
            }
        }
        candidates.sort();
        candidates.dedup();

        for candidate in candidates {
            if self.fits(candidate, duration, ops_to_add, arriving) {
                return Some(candidate);
            }
        }

        // Past every booked event only the residency floor remains.
        None
    }
}
