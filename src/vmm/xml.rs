//! Rendered artifacts handed to the external collaborators: the libvirt
//! domain definition and the load balancer's upstream configuration.

use std::net::Ipv4Addr;

/// Transient KVM domain definition for one guest. The disk is the guest's
/// own qcow2 clone under `imgs_path`; the guest-agent channel is required
/// for boot detection and address discovery.
pub fn domain_xml(imgs_path: &str, name: &str) -> String {
    format!(
        r#"<domain type='kvm'>
  <name>{name}</name>
  <memory unit='MiB'>512</memory>
  <vcpu>1</vcpu>
  <os>
    <type arch='x86_64' machine='pc-i440fx-2.9'>hvm</type>
    <boot dev='hd'/>
  </os>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='{imgs_path}/{name}.qcow2'/>
      <target dev='vda' bus='virtio'/>
      <address type='pci' domain='0x0000' bus='0x00' slot='0x04' function='0x0'/>
    </disk>
    <interface type='bridge'>
      <source bridge='virbr0'/>
      <model type='virtio'/>
      <address type='pci' domain='0x0000' bus='0x00' slot='0x03' function='0x0'/>
    </interface>
    <graphics type='vnc' port='-1' listen='0.0.0.0'/>
    <channel type='unix'>
      <target type='virtio' name='org.qemu.guest_agent.0'/>
    </channel>
  </devices>
</domain>
"#
    )
}

/// nginx configuration fronting one service's workers.
pub fn nginx_conf(listen_port: u16, upstream: &[(Ipv4Addr, u16)]) -> String {
    let servers = upstream
        .iter()
        .map(|(address, port)| format!("        server {address}:{port};"))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        r#"user nginx;

worker_processes auto;

pcre_jit on;

error_log /var/log/nginx/error.log warn;

include /etc/nginx/modules/*.conf;

events {{
    worker_connections 1024;
}}

http {{
    upstream backend {{
{servers}
    }}

    server {{
        listen {listen_port};

        location / {{
            proxy_pass http://backend;
        }}
    }}
}}
"#
    )
}
