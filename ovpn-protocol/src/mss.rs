//! TCP MSS clamping for tunneled IPv4 traffic

/// Default MSS ceiling
pub const DEFAULT_MAX_MSS: u16 = 1250;

const IPV4_VERSION: u8 = 4;
const PROTO_TCP: u8 = 6;
const TCP_FLAG_SYN: u8 = 0x02;
const TCP_MIN_HEADER: usize = 20;
const OPT_END: u8 = 0;
const OPT_NOP: u8 = 1;
const OPT_MSS: u8 = 2;
const OPT_MSS_LENGTH: u8 = 4;

/// Lower the MSS option of an IPv4 TCP SYN segment to at most `max_mss`
///
/// Anything that isn't a well-formed IPv4 TCP SYN is left untouched. The TCP
/// checksum is patched incrementally. Returns true if the packet was changed.
pub fn mss_fix(packet: &mut [u8], max_mss: u16) -> bool {
    let Some(&first) = packet.first() else {
        return false;
    };
    if first >> 4 != IPV4_VERSION {
        return false;
    }
    let ihl = usize::from(first & 0x0F) * 4;
    if ihl < 20 || packet.len() < ihl + TCP_MIN_HEADER || packet[9] != PROTO_TCP {
        return false;
    }
    // fragments other than the first carry no TCP header
    let frag_offset = u16::from_be_bytes([packet[6], packet[7]]) & 0x1FFF;
    if frag_offset != 0 {
        return false;
    }

    let tcp = &mut packet[ihl..];
    if tcp[13] & TCP_FLAG_SYN == 0 {
        return false;
    }
    let data_offset = usize::from(tcp[12] >> 4) * 4;
    if data_offset < TCP_MIN_HEADER || tcp.len() < data_offset {
        return false;
    }

    let mut i = TCP_MIN_HEADER;
    while i < data_offset {
        match tcp[i] {
            OPT_END => break,
            OPT_NOP => i += 1,
            kind => {
                if i + 1 >= data_offset {
                    break;
                }
                let len = usize::from(tcp[i + 1]);
                if len < 2 || i + len > data_offset {
                    break;
                }
                if kind == OPT_MSS && tcp[i + 1] == OPT_MSS_LENGTH {
                    let mss = u16::from_be_bytes([tcp[i + 2], tcp[i + 3]]);
                    if mss <= max_mss {
                        return false;
                    }
                    tcp[i + 2..i + 4].copy_from_slice(&max_mss.to_be_bytes());
                    let checksum = u16::from_be_bytes([tcp[16], tcp[17]]);
                    let patched = adjust_checksum(checksum, mss, max_mss);
                    tcp[16..18].copy_from_slice(&patched.to_be_bytes());
                    return true;
                }
                i += len;
            }
        }
    }
    false
}

/// Incremental one's complement update, `HC' = ~(~HC + ~m + m')`
fn adjust_checksum(checksum: u16, old: u16, new: u16) -> u16 {
    let mut sum = u32::from(!checksum) + u32::from(!old) + u32::from(new);
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}
