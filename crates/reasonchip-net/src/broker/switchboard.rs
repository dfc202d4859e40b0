//! Routing state shared by the broker's two transports.
//!
//! The switchboard is a synchronous state machine: every method mutates
//! under the broker's single lock and returns a decision; the broker
//! performs the resulting I/O after the lock is released.

use std::collections::{HashMap, HashSet, VecDeque};

use uuid::Uuid;

/// Binding of one in-flight run to its endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub client: Uuid,
    pub worker: Uuid,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RunDecision {
    /// Forward the RUN to this worker.
    Assigned(Uuid),
    /// No registered slot: answer NO_WORKER_AVAILABLE.
    NoWorker,
    /// The cookie already routes: protocol violation by the client.
    DuplicateCookie,
}

#[derive(Debug, Default)]
pub struct Switchboard {
    /// FIFO of worker slots, one entry per registered unit of capacity.
    available: VecDeque<Uuid>,
    routes: HashMap<Uuid, Route>,
    workers: HashSet<Uuid>,
    clients: HashSet<Uuid>,
}

impl Switchboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_connected(&mut self, client: Uuid) {
        self.clients.insert(client);
    }

    pub fn worker_connected(&mut self, worker: Uuid) {
        self.workers.insert(worker);
    }

    /// REGISTER: add one slot per advertised unit of capacity. Slots from
    /// unknown (already vanished) workers are ignored.
    pub fn register(&mut self, worker: Uuid, capacity: u32) {
        if !self.workers.contains(&worker) {
            return;
        }
        for _ in 0..capacity {
            self.available.push_back(worker);
        }
    }

    /// RUN: match the request to the front slot.
    pub fn route_run(&mut self, client: Uuid, cookie: Uuid) -> RunDecision {
        if self.routes.contains_key(&cookie) {
            return RunDecision::DuplicateCookie;
        }
        match self.available.pop_front() {
            Some(worker) => {
                self.routes.insert(cookie, Route { client, worker });
                RunDecision::Assigned(worker)
            }
            None => RunDecision::NoWorker,
        }
    }

    /// CANCEL from a client: the worker to forward to, if the route is
    /// known and owned by that client.
    pub fn route_cancel(&self, client: Uuid, cookie: Uuid) -> Option<Uuid> {
        self.routes
            .get(&cookie)
            .filter(|route| route.client == client)
            .map(|route| route.worker)
    }

    /// RESULT from a worker: release the route and name the client to
    /// forward to. An orphan cookie yields None and is discarded.
    pub fn route_result(&mut self, worker: Uuid, cookie: Uuid) -> Option<Uuid> {
        match self.routes.get(&cookie) {
            Some(route) if route.worker == worker => {
                let client = route.client;
                self.routes.remove(&cookie);
                Some(client)
            }
            _ => None,
        }
    }

    /// Client gone: drop its routes; each surviving worker gets a CANCEL.
    pub fn client_disconnected(&mut self, client: Uuid) -> Vec<(Uuid, Uuid)> {
        self.clients.remove(&client);
        let cookies: Vec<Uuid> = self
            .routes
            .iter()
            .filter(|(_, route)| route.client == client)
            .map(|(cookie, _)| *cookie)
            .collect();
        let mut cancels = Vec::new();
        for cookie in cookies {
            if let Some(route) = self.routes.remove(&cookie) {
                cancels.push((cookie, route.worker));
            }
        }
        cancels
    }

    /// Worker gone: purge its slots; each affected client gets a
    /// WORKER_LOST result.
    pub fn worker_disconnected(&mut self, worker: Uuid) -> Vec<(Uuid, Uuid)> {
        self.workers.remove(&worker);
        self.available.retain(|slot| *slot != worker);
        let cookies: Vec<Uuid> = self
            .routes
            .iter()
            .filter(|(_, route)| route.worker == worker)
            .map(|(cookie, _)| *cookie)
            .collect();
        let mut notifications = Vec::new();
        for cookie in cookies {
            if let Some(route) = self.routes.remove(&cookie) {
                notifications.push((cookie, route.client));
            }
        }
        notifications
    }

    pub fn live_workers(&self) -> Vec<Uuid> {
        self.workers.iter().copied().collect()
    }

    pub fn available_slots(&self) -> usize {
        self.available.len()
    }

    pub fn active_routes(&self) -> usize {
        self.routes.len()
    }

    pub fn routes_for_worker(&self, worker: Uuid) -> usize {
        self.routes
            .values()
            .filter(|route| route.worker == worker)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    #[test]
    fn test_run_matches_fifo_slot() {
        let mut board = Switchboard::new();
        let (w1, w2, client) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        board.worker_connected(w1);
        board.worker_connected(w2);
        board.client_connected(client);
        board.register(w1, 1);
        board.register(w2, 1);

        let cookies = ids(3);
        assert_eq!(board.route_run(client, cookies[0]), RunDecision::Assigned(w1));
        assert_eq!(board.route_run(client, cookies[1]), RunDecision::Assigned(w2));
        assert_eq!(board.route_run(client, cookies[2]), RunDecision::NoWorker);
    }

    #[test]
    fn test_duplicate_cookie_rejected() {
        let mut board = Switchboard::new();
        let (worker, client, cookie) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        board.worker_connected(worker);
        board.register(worker, 2);
        assert!(matches!(board.route_run(client, cookie), RunDecision::Assigned(_)));
        assert_eq!(board.route_run(client, cookie), RunDecision::DuplicateCookie);
    }

    #[test]
    fn test_result_releases_route() {
        let mut board = Switchboard::new();
        let (worker, client, cookie) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        board.worker_connected(worker);
        board.register(worker, 1);
        board.route_run(client, cookie);

        assert_eq!(board.route_result(worker, cookie), Some(client));
        assert_eq!(board.active_routes(), 0);
        // Orphan result afterwards is discarded.
        assert_eq!(board.route_result(worker, cookie), None);
    }

    #[test]
    fn test_result_from_wrong_worker_discarded() {
        let mut board = Switchboard::new();
        let (worker, imposter, client, cookie) =
            (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        board.worker_connected(worker);
        board.register(worker, 1);
        board.route_run(client, cookie);
        assert_eq!(board.route_result(imposter, cookie), None);
        assert_eq!(board.active_routes(), 1);
    }

    #[test]
    fn test_client_disconnect_cancels_routes() {
        let mut board = Switchboard::new();
        let (worker, client) = (Uuid::new_v4(), Uuid::new_v4());
        board.worker_connected(worker);
        board.register(worker, 2);
        let cookies = ids(2);
        board.route_run(client, cookies[0]);
        board.route_run(client, cookies[1]);

        let cancels = board.client_disconnected(client);
        assert_eq!(cancels.len(), 2);
        assert!(cancels.iter().all(|(_, w)| *w == worker));
        assert_eq!(board.active_routes(), 0);
    }

    #[test]
    fn test_worker_disconnect_notifies_and_purges_slots() {
        let mut board = Switchboard::new();
        let (worker, client, cookie) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        board.worker_connected(worker);
        board.register(worker, 3);
        board.route_run(client, cookie);
        assert_eq!(board.available_slots(), 2);

        let lost = board.worker_disconnected(worker);
        assert_eq!(lost, vec![(cookie, client)]);
        assert_eq!(board.available_slots(), 0);
    }

    #[test]
    fn test_register_from_unknown_worker_ignored() {
        let mut board = Switchboard::new();
        board.register(Uuid::new_v4(), 5);
        assert_eq!(board.available_slots(), 0);
    }

    #[test]
    fn test_route_accounting_invariant() {
        // |available| + |routes per worker| never exceeds registered
        // capacity for a live worker.
        let mut board = Switchboard::new();
        let (worker, client) = (Uuid::new_v4(), Uuid::new_v4());
        board.worker_connected(worker);
        board.register(worker, 2);

        let cookies = ids(3);
        for cookie in &cookies {
            board.route_run(client, *cookie);
        }
        assert!(board.available_slots() + board.routes_for_worker(worker) <= 2);

        board.route_result(worker, cookies[0]);
        board.register(worker, 1);
        assert!(board.available_slots() + board.routes_for_worker(worker) <= 2);
    }
}
