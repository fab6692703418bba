use sha1::{Digest, Sha1};
use std::net::IpAddr;

/// Fast-extension state tracked per peer.
///
/// `accept_fast` are the pieces we permit the remote to request while
/// choked, with a per-piece counter of blocks it has actually taken.
/// `allowed_fast` are the pieces the remote granted us.
#[derive(Debug, Clone, Default)]
pub struct FastState {
    /// Pieces we granted to the remote, paired with served-block counters.
    accept_fast: Vec<(u32, u32)>,
    /// Pieces the remote granted to us.
    allowed_fast: Vec<u32>,
    /// Pieces the remote suggested, newest last, length-capped.
    suggested: Vec<u32>,
}

/// Cap on remembered suggestions, matching the allowed-fast set scale.
const MAX_SUGGESTED: usize = 16;

impl FastState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a piece we sent in an `allowed-fast` message.
    pub fn grant(&mut self, piece: u32) {
        if self.accept_fast_index(piece).is_none() {
            self.accept_fast.push((piece, 0));
        }
    }

    fn accept_fast_index(&self, piece: u32) -> Option<usize> {
        self.accept_fast.iter().position(|(p, _)| *p == piece)
    }

    /// True if we accept requests for `piece` from a choked remote.
    pub fn is_granted(&self, piece: u32) -> bool {
        self.accept_fast_index(piece).is_some()
    }

    /// Bumps the served-block counter for a granted piece and returns the
    /// new count.
    pub fn count_granted_block(&mut self, piece: u32) -> u32 {
        match self.accept_fast_index(piece) {
            Some(i) => {
                self.accept_fast[i].1 += 1;
                self.accept_fast[i].1
            }
            None => 0,
        }
    }

    pub fn granted_pieces(&self) -> impl Iterator<Item = u32> + '_ {
        self.accept_fast.iter().map(|(p, _)| *p)
    }

    /// Records an `allowed-fast` grant from the remote.
    pub fn add_allowed(&mut self, piece: u32) {
        if !self.allowed_fast.contains(&piece) {
            self.allowed_fast.push(piece);
        }
    }

    /// True if the remote lets us request `piece` while it chokes us.
    pub fn is_allowed(&self, piece: u32) -> bool {
        self.allowed_fast.contains(&piece)
    }

    /// Withdraws a remote grant (after a reject while choked).
    pub fn remove_allowed(&mut self, piece: u32) {
        self.allowed_fast.retain(|p| *p != piece);
    }

    /// Records a suggestion, capping the remembered list.
    pub fn add_suggested(&mut self, piece: u32) {
        if !self.suggested.contains(&piece) {
            if self.suggested.len() >= MAX_SUGGESTED {
                self.suggested.remove(0);
            }
            self.suggested.push(piece);
        }
    }

    pub fn remove_suggested(&mut self, piece: u32) {
        self.suggested.retain(|p| *p != piece);
    }

    pub fn suggested_pieces(&self) -> &[u32] {
        &self.suggested
    }
}

/// Generates the allowed-fast set for a peer.
///
/// Deterministic hash chain over the masked remote address and the torrent
/// info-hash, yielding up to `set_size` distinct piece indices. The same
/// inputs always produce the same ordered set, so both sides can compute
/// it independently.
pub fn generate_allowed_fast_set(
    info_hash: &[u8; 20],
    peer_ip: IpAddr,
    num_pieces: u32,
    set_size: usize,
) -> Vec<u32> {
    if num_pieces == 0 {
        return Vec::new();
    }
    let set_size = set_size.min(num_pieces as usize);

    // /24 for v4, the leading 4 bytes for v6
    let ip_bytes = match peer_ip {
        IpAddr::V4(ip) => {
            let octets = ip.octets();
            [octets[0], octets[1], octets[2], 0]
        }
        IpAddr::V6(ip) => {
            let octets = ip.octets();
            [octets[0], octets[1], octets[2], octets[3]]
        }
    };

    let mut x = Vec::with_capacity(24);
    x.extend_from_slice(&ip_bytes);
    x.extend_from_slice(info_hash);

    let mut allowed_set = Vec::with_capacity(set_size);
    while allowed_set.len() < set_size {
        let mut hasher = Sha1::new();
        hasher.update(&x);
        let hash = hasher.finalize();

        for chunk in hash.chunks(4) {
            if allowed_set.len() >= set_size {
                break;
            }

            let index = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) % num_pieces;

            if !allowed_set.contains(&index) {
                allowed_set.push(index);
            }
        }

        x = hash.to_vec();
    }

    allowed_set
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_allowed_fast_set_is_deterministic() {
        let info_hash = [0xAAu8; 20];
        let ip = IpAddr::V4(Ipv4Addr::new(80, 4, 4, 200));

        let a = generate_allowed_fast_set(&info_hash, ip, 1313, 7);
        let b = generate_allowed_fast_set(&info_hash, ip, 1313, 7);
        assert_eq!(a, b);
        assert_eq!(a.len(), 7);

        // distinct indices, all in range
        for (i, piece) in a.iter().enumerate() {
            assert!(*piece < 1313);
            assert!(!a[..i].contains(piece));
        }
    }

    #[test]
    fn test_allowed_fast_set_masks_low_octet() {
        let info_hash = [3u8; 20];
        let a = generate_allowed_fast_set(
            &info_hash,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            100,
            10,
        );
        let b = generate_allowed_fast_set(
            &info_hash,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 99)),
            100,
            10,
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_allowed_fast_set_capped_by_piece_count() {
        let set = generate_allowed_fast_set(
            &[1u8; 20],
            IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)),
            3,
            10,
        );
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_grant_counters() {
        let mut fast = FastState::new();
        fast.grant(4);
        fast.grant(4);
        assert!(fast.is_granted(4));
        assert!(!fast.is_granted(5));

        assert_eq!(fast.count_granted_block(4), 1);
        assert_eq!(fast.count_granted_block(4), 2);
        assert_eq!(fast.count_granted_block(5), 0);
    }

    #[test]
    fn test_suggested_list_is_capped() {
        let mut fast = FastState::new();
        for piece in 0..40 {
            fast.add_suggested(piece);
        }
        assert_eq!(fast.suggested_pieces().len(), MAX_SUGGESTED);
        // oldest entries were dropped
        assert!(!fast.suggested_pieces().contains(&0));
        assert!(fast.suggested_pieces().contains(&39));
    }
}
