//! 内置默认模板
//!
//! 没有配置 templates.yaml 时使用，每个输出类别一份。

pub const DEFAULT_TEMPLATES: &str = r#"# rule-overlay built-in templates
templates:
  - name: default-clash
    category: clash
    proxy_groups:
      - Proxy
      - Auto
    sections:
      dns:
        - "enable: true"
        - "ipv6: false"
        - "enhanced-mode: fake-ip"
        - "fake-ip-range: 198.18.0.1/16"
        - "nameserver:"
        - "  - https://223.5.5.5/dns-query"
        - "  - https://doh.pub/dns-query"
        - "fallback:"
        - "  - https://1.1.1.1/dns-query"
        - "  - https://8.8.8.8/dns-query"
      rule_providers: []
      routing:
        - "DOMAIN-SUFFIX,local,DIRECT"
        - "IP-CIDR,127.0.0.0/8,DIRECT,no-resolve"
        - "IP-CIDR,192.168.0.0/16,DIRECT,no-resolve"
        - "IP-CIDR,10.0.0.0/8,DIRECT,no-resolve"
        - "GEOIP,CN,DIRECT"
        - "MATCH,Proxy"

  - name: default-surge
    category: surge
    proxy_groups:
      - Proxy
      - Auto
    sections:
      dns:
        - "dns-server = 223.5.5.5, 119.29.29.29"
        - "encrypted-dns-server = https://223.5.5.5/dns-query"
      rule_providers: []
      routing:
        - "DOMAIN-SUFFIX,local,DIRECT"
        - "IP-CIDR,127.0.0.0/8,DIRECT,no-resolve"
        - "IP-CIDR,192.168.0.0/16,DIRECT,no-resolve"
        - "IP-CIDR,10.0.0.0/8,DIRECT,no-resolve"
        - "GEOIP,CN,DIRECT"
        - "FINAL,Proxy"
"#;
