//! Hostname to IPv4 address resolution over a UDP socket
//!
//! One A-record query per attempt is sent to the controller's DNS server,
//! then the socket is polled for a matching answer. Replies with the wrong
//! id or from another host are ignored. The lookup gives up after
//! `dns_retry_max` unanswered queries.

use core::net::{Ipv4Addr, SocketAddrV4};

use embassy_sync::blocking_mutex::raw::RawMutex;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;
use heapless::Vec;

use super::{Protocol, SocketFlags, SocketHandle, W5200};
use crate::error::Error;

pub const DNS_PORT: u16 = 53;

const HEADER_LEN: usize = 12;
const NAME_MAX: usize = 255;
const LABEL_MAX: usize = 63;
const QUERY_MAX: usize = HEADER_LEN + NAME_MAX + 2 + 4;
const RESPONSE_MAX: usize = 512;

/// Standard query, recursion desired
const FLAGS_QUERY: u16 = 0x0100;
const FLAG_RESPONSE: u16 = 0x8000;
const RCODE_MASK: u16 = 0x000f;

const TYPE_A: u16 = 1;
const CLASS_IN: u16 = 1;

/// Build a single-question A query for `hostname`
fn build_query(id: u16, hostname: &str) -> Result<Vec<u8, QUERY_MAX>, Error> {
    let name = hostname.strip_suffix('.').unwrap_or(hostname);
    if name.is_empty() || name.len() > NAME_MAX {
        return Err(Error::InvalidArgument);
    }

    let mut query = Vec::new();
    let mut put = |bytes: &[u8]| {
        query
            .extend_from_slice(bytes)
            .map_err(|_| Error::InvalidArgument)
    };

    put(&id.to_be_bytes())?;
    put(&FLAGS_QUERY.to_be_bytes())?;
    // One question, no answer, authority or additional records
    put(&[0, 1, 0, 0, 0, 0, 0, 0])?;

    for label in name.split('.') {
        if label.is_empty() || label.len() > LABEL_MAX {
            return Err(Error::InvalidArgument);
        }
        put(&[label.len() as u8])?;
        put(label.as_bytes())?;
    }
    put(&[0])?;
    put(&TYPE_A.to_be_bytes())?;
    put(&CLASS_IN.to_be_bytes())?;
    Ok(query)
}

fn be16(buf: &[u8], pos: usize) -> Result<u16, Error> {
    match buf.get(pos..pos + 2) {
        Some(bytes) => Ok(u16::from_be_bytes([bytes[0], bytes[1]])),
        None => Err(Error::AddressResolutionFailed),
    }
}

/// Position just past the (possibly compressed) name at `pos`
fn skip_name(buf: &[u8], mut pos: usize) -> Result<usize, Error> {
    loop {
        let len = *buf.get(pos).ok_or(Error::AddressResolutionFailed)? as usize;
        match len & 0xc0 {
            0x00 if len == 0 => return Ok(pos + 1),
            0x00 => pos += 1 + len,
            // Compression pointer ends the name
            0xc0 => return Ok(pos + 2),
            _ => return Err(Error::AddressResolutionFailed),
        }
    }
}

/// Extract the first A record of a reply to query `id`
///
/// `Ok(None)` means the datagram is not an answer to this query.
fn parse_response(id: u16, buf: &[u8]) -> Result<Option<Ipv4Addr>, Error> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let flags = be16(buf, 2)?;
    if be16(buf, 0)? != id || flags & FLAG_RESPONSE == 0 {
        return Ok(None);
    }
    if flags & RCODE_MASK != 0 {
        debug!("DNS server returned rcode {}", flags & RCODE_MASK);
        return Err(Error::AddressResolutionFailed);
    }

    let questions = be16(buf, 4)?;
    let answers = be16(buf, 6)?;

    let mut pos = HEADER_LEN;
    for _ in 0..questions {
        pos = skip_name(buf, pos)? + 4;
    }

    for _ in 0..answers {
        pos = skip_name(buf, pos)?;
        let rtype = be16(buf, pos)?;
        let class = be16(buf, pos + 2)?;
        let rdlength = be16(buf, pos + 8)? as usize;
        pos += 10;

        if rtype == TYPE_A && class == CLASS_IN && rdlength == 4 {
            let addr = buf
                .get(pos..pos + 4)
                .ok_or(Error::AddressResolutionFailed)?;
            return Ok(Some(Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3])));
        }
        pos += rdlength;
    }
    Err(Error::AddressResolutionFailed)
}

/// DNS client bound to one UDP socket of a [`W5200`]
///
/// The socket goes back to the pool when the resolver is dropped.
pub struct AddressResolver<'n, 'a, M, B, CS, D, const N: usize>
where
    M: RawMutex,
    B: SpiBus,
    CS: OutputPin,
    D: DelayNs,
{
    net: &'n mut W5200<'a, M, B, CS, D, N>,
    handle: SocketHandle,
    server: SocketAddrV4,
}

impl<'n, 'a, M, B, CS, D, const N: usize> AddressResolver<'n, 'a, M, B, CS, D, N>
where
    M: RawMutex,
    B: SpiBus,
    CS: OutputPin,
    D: DelayNs,
{
    /// Open a UDP socket on a dynamic port for queries to `server`
    pub fn new(net: &'n mut W5200<'a, M, B, CS, D, N>, server: Ipv4Addr) -> Result<Self, Error> {
        if server.is_unspecified() {
            return Err(Error::AddressResolutionFailed);
        }
        let handle = net.socket(Protocol::Udp, 0, SocketFlags::empty())?;
        Ok(Self {
            net,
            handle,
            server: SocketAddrV4::new(server, DNS_PORT),
        })
    }

    /// Look up the first A record for `hostname`
    pub fn resolve(&mut self, hostname: &str) -> Result<Ipv4Addr, Error> {
        let retries = self.net.config.dns_retry_max;
        for attempt in 0..retries {
            let id = self.net.next_dns_id();
            let query = build_query(id, hostname)?;
            self.net.get(self.handle).send_to(&query, self.server)?;

            if let Some(addr) = self.poll(id)? {
                let octets = addr.octets();
                debug!(
                    "Resolved {} to {}.{}.{}.{}",
                    hostname, octets[0], octets[1], octets[2], octets[3]
                );
                return Ok(addr);
            }
            debug!("DNS query {} for {} unanswered", attempt + 1, hostname);
        }
        warn!("Could not resolve {}", hostname);
        Err(Error::AddressResolutionFailed)
    }

    fn poll(&mut self, id: u16) -> Result<Option<Ipv4Addr>, Error> {
        let mut buf = [0u8; RESPONSE_MAX];
        for _ in 0..self.net.config.dns_poll_max {
            while let Some((len, from)) = self.net.get(self.handle).recv_from(&mut buf)? {
                if from != self.server {
                    continue;
                }
                if let Some(addr) = parse_response(id, &buf[..len])? {
                    return Ok(Some(addr));
                }
            }
            let ms = self.net.config.dns_poll_ms;
            self.net.delay.delay_ms(ms);
        }
        Ok(None)
    }
}

impl<M, B, CS, D, const N: usize> Drop for AddressResolver<'_, '_, M, B, CS, D, N>
where
    M: RawMutex,
    B: SpiBus,
    CS: OutputPin,
    D: DelayNs,
{
    fn drop(&mut self) {
        if self.net.get(self.handle).close().is_err() {
            warn!("DNS socket close failed");
        }
    }
}

/// Resolve `hostname` with the controller's DNS server
///
/// Dotted-quad literals are returned without a query.
pub fn resolve<M, B, CS, D, const N: usize>(
    net: &mut W5200<'_, M, B, CS, D, N>,
    hostname: &str,
) -> Result<Ipv4Addr, Error>
where
    M: RawMutex,
    B: SpiBus,
    CS: OutputPin,
    D: DelayNs,
{
    if let Ok(addr) = hostname.parse::<Ipv4Addr>() {
        return Ok(addr);
    }
    let server = net.dns_addr();
    AddressResolver::new(net, server)?.resolve(hostname)
}
